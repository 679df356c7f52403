//! Value-level dataflow over a module.
//!
//! Every array leaf produced by a defining instruction is a value. Values
//! are then visible at further positions through instructions that only
//! forward storage (`tuple`, `get_tuple_element`, `bitcast`, computation
//! parameters, `while` results and the done half of asynchronous copies).
use std::fmt;

use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};

use crate::{
    inst::{InstId, Opcode},
    module::{CompId, Module},
    types::{ArrayShape, ShapeIndex},
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(u32);
entity_impl!(ValueId, "v");

/// An instruction output leaf at which a value is visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub inst: InstId,
    pub index: ShapeIndex,
}

impl Position {
    pub fn new(inst: InstId, index: ShapeIndex) -> Self {
        Self { inst, index }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.inst, self.index)
    }
}

/// An operand leaf of an instruction reading a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Use {
    pub inst: InstId,
    pub operand: u32,
    /// Index into the operand's shape.
    pub index: ShapeIndex,
}

impl fmt::Display for Use {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.inst, self.operand, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub defining: Position,
    /// All positions including the defining one, in discovery order.
    pub positions: Vec<Position>,
    pub uses: Vec<Use>,
    pub shape: ArrayShape,
}

impl ValueData {
    pub fn size(&self) -> u64 {
        self.shape.byte_size()
    }
}

#[derive(Debug, Default)]
pub struct Dataflow {
    values: PrimaryMap<ValueId, ValueData>,
    leaf_values: SecondaryMap<InstId, Vec<(ShapeIndex, ValueId)>>,
}

impl Dataflow {
    /// Runs the analysis from the entry computation. Computations are
    /// analysed when their call site is reached, with their parameters bound
    /// to the caller's operands.
    pub fn analyze(module: &Module) -> Self {
        let mut df = Self::default();
        if let Some(entry) = module.entry() {
            df.analyze_comp(module, entry, &[]);
        }
        df
    }

    pub fn values(&self) -> impl Iterator<Item = (ValueId, &ValueData)> {
        self.values.iter()
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values visible at each leaf of `inst`'s output.
    pub fn values_at(&self, inst: InstId) -> &[(ShapeIndex, ValueId)] {
        &self.leaf_values[inst]
    }

    pub fn value_at(&self, inst: InstId, index: &ShapeIndex) -> Option<ValueId> {
        self.leaf_values[inst]
            .iter()
            .find_map(|(idx, v)| (idx == index).then_some(*v))
    }

    fn analyze_comp(&mut self, module: &Module, comp: CompId, bindings: &[Vec<(ShapeIndex, ValueId)>]) {
        for &inst in module.comps[comp].sequence() {
            let data = module.inst(inst);
            match data.opcode {
                Opcode::Parameter => {
                    let number = data.attrs.number.unwrap_or(0) as usize;
                    match bindings.get(number) {
                        Some(bound) => self.forward(inst, bound.clone()),
                        None => self.define_all(module, inst),
                    }
                }

                Opcode::Tuple => {
                    let mut leaves = Vec::new();
                    for (i, &op) in data.operands.iter().enumerate() {
                        for (idx, v) in &self.leaf_values[op] {
                            leaves.push((idx.prepend(i as u32), *v));
                        }
                    }
                    self.forward(inst, leaves);
                }

                Opcode::GetTupleElement => {
                    let index = data.attrs.index.unwrap_or(0);
                    let leaves = self.leaf_values[data.operands[0]]
                        .iter()
                        .filter(|(idx, _)| idx.first() == Some(index))
                        .map(|(idx, v)| (idx.tail(), *v))
                        .collect();
                    self.forward(inst, leaves);
                }

                Opcode::Bitcast => {
                    let leaves = self.leaf_values[data.operands[0]].clone();
                    self.forward(inst, leaves);
                }

                Opcode::While => {
                    let init = self.leaf_values[data.operands[0]].clone();
                    let (cond, body) = (data.called[0], data.called[1]);
                    self.analyze_comp(module, cond, &[init.clone()]);
                    self.analyze_comp(module, body, &[init]);
                    self.add_uses(inst, &data.operands);
                    let carried = match module.comps[body].root() {
                        Some(root) => self.leaf_values[root].clone(),
                        None => Vec::new(),
                    };
                    self.forward(inst, carried);
                }

                Opcode::Conditional => {
                    for (i, &branch) in data.called.iter().enumerate() {
                        let bound = data
                            .operands
                            .get(i + 1)
                            .map(|&op| self.leaf_values[op].clone())
                            .unwrap_or_default();
                        self.analyze_comp(module, branch, &[bound]);
                    }
                    self.add_uses(inst, &data.operands);
                    self.define_all(module, inst);
                }

                Opcode::CopyStart | Opcode::SliceStart => {
                    let src = data.operands[0];
                    self.add_uses(inst, &data.operands);
                    let mut leaves = Vec::new();
                    for (idx, shape) in data.shape.leaves() {
                        match idx.first() {
                            Some(1) => {}
                            _ => {
                                let v = self.new_value(Position::new(inst, idx.clone()), shape.clone());
                                leaves.push((idx, v));
                            }
                        }
                    }
                    for (idx, v) in self.leaf_values[src].clone() {
                        let idx = idx.prepend(1);
                        self.values[v].positions.push(Position::new(inst, idx.clone()));
                        leaves.push((idx, v));
                    }
                    leaves.sort_by(|a, b| a.0.cmp(&b.0));
                    self.leaf_values[inst] = leaves;
                }

                Opcode::CopyDone | Opcode::SliceDone => {
                    let start = data.operands[0];
                    let mut forwarded = Vec::new();
                    for (idx, v) in self.leaf_values[start].clone() {
                        if idx.first() == Some(0) {
                            forwarded.push((idx.tail(), v));
                        } else {
                            self.values[v].uses.push(Use {
                                inst,
                                operand: 0,
                                index: idx,
                            });
                        }
                    }
                    self.forward(inst, forwarded);
                }

                _ => {
                    self.add_uses(inst, &data.operands);
                    self.define_all(module, inst);
                }
            }
        }
    }

    fn new_value(&mut self, defining: Position, shape: ArrayShape) -> ValueId {
        self.values.push(ValueData {
            positions: vec![defining.clone()],
            defining,
            uses: Vec::new(),
            shape,
        })
    }

    fn define_all(&mut self, module: &Module, inst: InstId) {
        let leaves = module
            .shape(inst)
            .leaves()
            .into_iter()
            .map(|(idx, shape)| {
                let v = self.new_value(Position::new(inst, idx.clone()), shape.clone());
                (idx, v)
            })
            .collect();
        self.leaf_values[inst] = leaves;
    }

    fn forward(&mut self, inst: InstId, leaves: Vec<(ShapeIndex, ValueId)>) {
        for (idx, v) in &leaves {
            self.values[*v].positions.push(Position::new(inst, idx.clone()));
        }
        self.leaf_values[inst] = leaves;
    }

    fn add_uses(&mut self, inst: InstId, operands: &[InstId]) {
        for (operand, &op) in operands.iter().enumerate() {
            for (idx, v) in self.leaf_values[op].clone() {
                self.values[v].uses.push(Use {
                    inst,
                    operand: operand as u32,
                    index: idx,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ModuleBuilder,
        types::{PrimitiveType, Shape},
    };

    #[test]
    fn tuples_forward_positions() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let a = b.param("a", 0, f.clone());
        let n = b.unary("n", Opcode::Negate, a);
        let t = b.tuple("t", &[a, n]);
        let g = b.get_tuple_element("g", t, 1);
        let e = b.unary("e", Opcode::Exp, g);
        let main = b.finish(e);
        mb.set_entry(main);
        let module = mb.build();

        let df = Dataflow::analyze(&module);
        assert_eq!(df.len(), 3);

        let vn = df.value_at(n, &ShapeIndex::empty()).unwrap();
        let data = df.value(vn);
        assert_eq!(data.defining.inst, n);
        let insts: Vec<_> = data.positions.iter().map(|p| p.inst).collect();
        assert_eq!(insts, vec![n, t, g]);
        assert_eq!(data.uses.len(), 1);
        assert_eq!(data.uses[0].inst, e);
        assert_eq!(data.size(), 16);

        let va = df.value_at(a, &ShapeIndex::empty()).unwrap();
        assert_eq!(df.value_at(t, &ShapeIndex::from_slice(&[0])), Some(va));
    }

    #[test]
    fn while_binds_parameters_and_results() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let state = Shape::tuple(vec![f.clone(), f.clone()]);
        let mut mb = ModuleBuilder::new("m");

        let mut b = mb.computation("cond");
        b.param("p", 0, state.clone());
        let c = b.constant("c", Shape::scalar(PrimitiveType::Pred));
        let cond = b.finish(c);

        let mut b = mb.computation("body");
        let p = b.param("p", 0, state.clone());
        let x = b.get_tuple_element("x", p, 0);
        let k = b.get_tuple_element("k", p, 1);
        let y = b.binary("y", Opcode::Add, x, k);
        let r = b.tuple("r", &[y, k]);
        let body = b.finish(r);

        let mut b = mb.computation("main");
        let a = b.param("a", 0, f.clone());
        let k0 = b.param("k0", 1, f);
        let init = b.tuple("init", &[a, k0]);
        let w = b.while_loop("w", init, cond, body);
        let out = b.get_tuple_element("out", w, 0);
        let main = b.finish(out);
        mb.set_entry(main);
        let module = mb.build();

        let df = Dataflow::analyze(&module);
        let va = df.value_at(a, &ShapeIndex::empty()).unwrap();
        let vk = df.value_at(k0, &ShapeIndex::empty()).unwrap();
        let vy = df.value_at(y, &ShapeIndex::empty()).unwrap();

        assert_eq!(df.value_at(x, &ShapeIndex::empty()), Some(va));
        // The invariant leaf flows through the loop unchanged.
        assert_eq!(df.value_at(w, &ShapeIndex::from_slice(&[1])), Some(vk));
        assert_eq!(df.value_at(out, &ShapeIndex::empty()), Some(vy));
        assert!(df.value(va).uses.iter().any(|u| u.inst == w));
        assert!(df.value(va).uses.iter().any(|u| u.inst == y));
    }
}
