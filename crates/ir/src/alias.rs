//! Groups values that must share storage into buffers.
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};

use crate::{
    dataflow::{Dataflow, ValueId},
    inst::Opcode,
    module::Module,
    types::ShapeIndex,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u32);
entity_impl!(BufferId, "buf");

#[derive(Debug, Default)]
pub struct AliasAnalysis {
    /// Indexed by value number.
    buffer_of: Vec<BufferId>,
    buffers: PrimaryMap<BufferId, Vec<ValueId>>,
}

impl AliasAnalysis {
    /// Builds buffers from the storage-sharing rules of the IR:
    /// * a `while` operand leaf shares storage with the body root leaf at the same index,
    /// * a `conditional` result leaf shares storage with every branch root leaf,
    /// * `dynamic_update_slice` updates operand 0 in place.
    pub fn analyze(module: &Module, dataflow: &Dataflow) -> Self {
        let mut sets = UnionFind::new(dataflow.len());

        for (inst, data) in module.insts.iter() {
            let inst_values = |inst| dataflow.values_at(inst).to_vec();
            match data.opcode {
                Opcode::While => {
                    let Some(root) = module.comps[data.called[1]].root() else {
                        continue;
                    };
                    for (idx, init) in inst_values(data.operands[0]) {
                        if let Some(carried) = dataflow.value_at(root, &idx) {
                            sets.union(init.as_u32(), carried.as_u32());
                        }
                    }
                }

                Opcode::Conditional => {
                    for (idx, out) in inst_values(inst) {
                        for &branch in &data.called {
                            let Some(root) = module.comps[branch].root() else {
                                continue;
                            };
                            if let Some(v) = dataflow.value_at(root, &idx) {
                                sets.union(out.as_u32(), v.as_u32());
                            }
                        }
                    }
                }

                Opcode::DynamicUpdateSlice => {
                    let out = dataflow.value_at(inst, &ShapeIndex::empty());
                    let operand = dataflow.value_at(data.operands[0], &ShapeIndex::empty());
                    if let (Some(out), Some(operand)) = (out, operand) {
                        sets.union(out.as_u32(), operand.as_u32());
                    }
                }

                _ => {}
            }
        }

        let mut analysis = Self::default();
        let mut root_buffer: SecondaryMap<ValueId, Option<BufferId>> = SecondaryMap::new();
        for (v, _) in dataflow.values() {
            let root = ValueId::from_u32(sets.find(v.as_u32()));
            let buffer = match root_buffer[root] {
                Some(b) => b,
                None => {
                    let b = analysis.buffers.push(Vec::new());
                    root_buffer[root] = Some(b);
                    b
                }
            };
            analysis.buffers[buffer].push(v);
            analysis.buffer_of.push(buffer);
        }
        analysis
    }

    pub fn buffer_of(&self, v: ValueId) -> BufferId {
        self.buffer_of[v.index()]
    }

    /// Values of `buffer` in ascending id order.
    pub fn values(&self, buffer: BufferId) -> &[ValueId] {
        &self.buffers[buffer]
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferId, &[ValueId])> {
        self.buffers.iter().map(|(b, vs)| (b, vs.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let next = self.parent[x as usize];
            self.parent[x as usize] = self.parent[next as usize];
            x = next;
        }
        x
    }

    /// The smaller id becomes the representative so buffer numbering follows
    /// value numbering.
    fn union(&mut self, a: u32, b: u32) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            self.parent[hi as usize] = lo;
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
    fn loop_carry_and_in_place_update_share_buffers() {
        let f = Shape::array(PrimitiveType::F32, &[8]);
        let i = Shape::scalar(PrimitiveType::S32);
        let mut mb = ModuleBuilder::new("m");

        let mut b = mb.computation("cond");
        b.param("p", 0, f.clone());
        let c = b.constant("c", Shape::scalar(PrimitiveType::Pred));
        let cond = b.finish(c);

        let mut b = mb.computation("body");
        let p = b.param("p", 0, f.clone());
        let n = b.unary("n", Opcode::Negate, p);
        let body = b.finish(n);

        let mut b = mb.computation("main");
        let a = b.param("a", 0, f.clone());
        let u = b.param("u", 1, Shape::array(PrimitiveType::F32, &[2]));
        let k = b.constant("k", i);
        let d = b.dynamic_update_slice("d", a, u, k);
        let w = b.while_loop("w", d, cond, body);
        let e = b.unary("e", Opcode::Exp, w);
        let main = b.finish(e);
        mb.set_entry(main);
        let module = mb.build();

        let df = Dataflow::analyze(&module);
        let aa = AliasAnalysis::analyze(&module, &df);
        let at = |inst| df.value_at(inst, &ShapeIndex::empty()).unwrap();

        let buf = aa.buffer_of(at(a));
        assert_eq!(aa.buffer_of(at(d)), buf);
        assert_eq!(aa.buffer_of(at(n)), buf);
        assert_eq!(aa.values(buf), &[at(a), at(d), at(n)]);
        assert_ne!(aa.buffer_of(at(u)), buf);
        assert_ne!(aa.buffer_of(at(e)), buf);
    }
}
