//! Programmatic construction of modules.
//!
//! Shapes are inferred where the opcode determines them; everything else
//! takes an explicit shape.
use smol_str::SmolStr;

use crate::{
    inst::{Attrs, InstData, InstId, Opcode, SliceRange},
    module::{CompId, Module},
    types::{PrimitiveType, Shape, DEFAULT_MEMORY_SPACE},
};

pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    /// Starts a new computation. Nested computations must be built before
    /// the instruction calling them.
    pub fn computation(&mut self, name: impl Into<SmolStr>) -> CompBuilder<'_> {
        let comp = self.module.add_computation(name);
        CompBuilder {
            module: &mut self.module,
            comp,
        }
    }

    pub fn set_entry(&mut self, comp: CompId) {
        self.module.set_entry(comp);
    }

    pub fn build(self) -> Module {
        self.module
    }
}

pub struct CompBuilder<'a> {
    module: &'a mut Module,
    comp: CompId,
}

impl<'a> CompBuilder<'a> {
    pub fn id(&self) -> CompId {
        self.comp
    }

    pub fn shape(&self, inst: InstId) -> &Shape {
        self.module.shape(inst)
    }

    pub fn inst(&mut self, data: InstData) -> InstId {
        self.module.append_inst(self.comp, data)
    }

    pub fn param(&mut self, name: &str, number: u32, shape: Shape) -> InstId {
        let attrs = Attrs {
            number: Some(number),
            ..Default::default()
        };
        self.inst(InstData::new(name, Opcode::Parameter, shape).with_attrs(attrs))
    }

    pub fn constant(&mut self, name: &str, shape: Shape) -> InstId {
        self.inst(InstData::new(name, Opcode::Constant, shape))
    }

    pub fn unary(&mut self, name: &str, op: Opcode, x: InstId) -> InstId {
        debug_assert!(op.is_elementwise_unary());
        let shape = uncoloured(self.module.shape(x));
        self.inst(InstData::new(name, op, shape).with_operands(&[x]))
    }

    pub fn binary(&mut self, name: &str, op: Opcode, lhs: InstId, rhs: InstId) -> InstId {
        debug_assert!(op.is_elementwise_binary());
        let shape = uncoloured(self.module.shape(lhs));
        self.inst(InstData::new(name, op, shape).with_operands(&[lhs, rhs]))
    }

    pub fn compare(&mut self, name: &str, lhs: InstId, rhs: InstId) -> InstId {
        let shape = match self.module.shape(lhs).as_array() {
            Some(a) => Shape::array(PrimitiveType::Pred, &a.dims),
            None => Shape::scalar(PrimitiveType::Pred),
        };
        self.inst(InstData::new(name, Opcode::Compare, shape).with_operands(&[lhs, rhs]))
    }

    /// Matrix or vector product. The result keeps the leading dimensions of
    /// `lhs` and the trailing dimension of `rhs`.
    pub fn dot(&mut self, name: &str, lhs: InstId, rhs: InstId) -> InstId {
        let l = self.module.shape(lhs).as_array().cloned();
        let r = self.module.shape(rhs).as_array().cloned();
        let shape = match (l, r) {
            (Some(l), Some(r)) => {
                let mut dims: Vec<u64> = l.dims.iter().copied().collect();
                dims.pop();
                if r.rank() > 1 {
                    dims.push(r.dims[r.rank() - 1]);
                }
                Shape::array(l.elem, &dims)
            }
            _ => Shape::scalar(PrimitiveType::F32),
        };
        self.inst(InstData::new(name, Opcode::Dot, shape).with_operands(&[lhs, rhs]))
    }

    pub fn reduce(&mut self, name: &str, x: InstId, dim: u32) -> InstId {
        let shape = match self.module.shape(x).as_array() {
            Some(a) => {
                let dims: Vec<u64> = a
                    .dims
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i as u32 != dim)
                    .map(|(_, d)| *d)
                    .collect();
                Shape::array(a.elem, &dims)
            }
            None => Shape::scalar(PrimitiveType::F32),
        };
        let attrs = Attrs {
            dim: Some(dim),
            ..Default::default()
        };
        self.inst(
            InstData::new(name, Opcode::Reduce, shape)
                .with_operands(&[x])
                .with_attrs(attrs),
        )
    }

    pub fn broadcast(&mut self, name: &str, x: InstId, shape: Shape) -> InstId {
        self.inst(InstData::new(name, Opcode::Broadcast, shape).with_operands(&[x]))
    }

    pub fn concatenate(&mut self, name: &str, xs: &[InstId], dim: u32) -> InstId {
        let mut shape = xs
            .first()
            .and_then(|&x| self.module.shape(x).as_array().cloned())
            .map(|a| a.with_memory_space(DEFAULT_MEMORY_SPACE));
        if let Some(a) = shape.as_mut() {
            let total: u64 = xs
                .iter()
                .filter_map(|&x| self.module.shape(x).as_array())
                .map(|s| s.dims.get(dim as usize).copied().unwrap_or(0))
                .sum();
            if let Some(d) = a.dims.get_mut(dim as usize) {
                *d = total;
            }
        }
        let shape = shape.map_or_else(|| Shape::scalar(PrimitiveType::F32), Shape::Array);
        let attrs = Attrs {
            dim: Some(dim),
            ..Default::default()
        };
        self.inst(
            InstData::new(name, Opcode::Concatenate, shape)
                .with_operands(xs)
                .with_attrs(attrs),
        )
    }

    pub fn dynamic_update_slice(
        &mut self,
        name: &str,
        operand: InstId,
        update: InstId,
        index: InstId,
    ) -> InstId {
        let shape = uncoloured(self.module.shape(operand));
        self.inst(
            InstData::new(name, Opcode::DynamicUpdateSlice, shape)
                .with_operands(&[operand, update, index]),
        )
    }

    pub fn tuple(&mut self, name: &str, xs: &[InstId]) -> InstId {
        let shape = Shape::tuple(xs.iter().map(|&x| self.module.shape(x).clone()).collect());
        self.inst(InstData::new(name, Opcode::Tuple, shape).with_operands(xs))
    }

    pub fn get_tuple_element(&mut self, name: &str, x: InstId, index: u32) -> InstId {
        let shape = self
            .module
            .shape(x)
            .tuple_elements()
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| Shape::tuple(vec![]));
        let attrs = Attrs {
            index: Some(index),
            ..Default::default()
        };
        self.inst(
            InstData::new(name, Opcode::GetTupleElement, shape)
                .with_operands(&[x])
                .with_attrs(attrs),
        )
    }

    pub fn bitcast(&mut self, name: &str, x: InstId, shape: Shape) -> InstId {
        self.inst(InstData::new(name, Opcode::Bitcast, shape).with_operands(&[x]))
    }

    pub fn while_loop(
        &mut self,
        name: &str,
        init: InstId,
        condition: CompId,
        body: CompId,
    ) -> InstId {
        let shape = self.module.shape(init).clone();
        self.inst(
            InstData::new(name, Opcode::While, shape)
                .with_operands(&[init])
                .with_called(&[condition, body]),
        )
    }

    /// `operands[0]` selects the branch, `operands[1 + i]` is passed to
    /// `branches[i]`.
    pub fn conditional(
        &mut self,
        name: &str,
        operands: &[InstId],
        branches: &[CompId],
        shape: Shape,
    ) -> InstId {
        self.inst(
            InstData::new(name, Opcode::Conditional, shape)
                .with_operands(operands)
                .with_called(branches),
        )
    }

    pub fn copy_start(&mut self, name: &str, x: InstId, memory_space: i64) -> InstId {
        let src = self.module.shape(x).clone();
        let shape = async_start_shape(src.recoloured(memory_space), src);
        self.inst(InstData::new(name, Opcode::CopyStart, shape).with_operands(&[x]))
    }

    pub fn slice_start(
        &mut self,
        name: &str,
        x: InstId,
        ranges: Vec<SliceRange>,
        memory_space: i64,
    ) -> InstId {
        let src = self.module.shape(x).clone();
        let dst = match src.as_array() {
            Some(a) => {
                let dims: Vec<u64> = ranges.iter().map(SliceRange::len).collect();
                Shape::Array(
                    crate::types::ArrayShape::new(a.elem, &dims).with_memory_space(memory_space),
                )
            }
            None => src.clone(),
        };
        let attrs = Attrs {
            slice: Some(ranges),
            ..Default::default()
        };
        self.inst(
            InstData::new(name, Opcode::SliceStart, async_start_shape(dst, src))
                .with_operands(&[x])
                .with_attrs(attrs),
        )
    }

    pub fn async_done(&mut self, name: &str, start: InstId) -> InstId {
        let opcode = match self.module.opcode(start) {
            Opcode::SliceStart => Opcode::SliceDone,
            _ => Opcode::CopyDone,
        };
        let shape = self
            .module
            .shape(start)
            .tuple_elements()
            .first()
            .cloned()
            .unwrap_or_else(|| Shape::tuple(vec![]));
        self.inst(InstData::new(name, opcode, shape).with_operands(&[start]))
    }

    pub fn slice_concat(&mut self, name: &str, slices: &[InstId], dim: u32, shape: Shape) -> InstId {
        let attrs = Attrs {
            dim: Some(dim),
            ..Default::default()
        };
        self.inst(
            InstData::new(name, Opcode::SliceConcat, shape)
                .with_operands(slices)
                .with_attrs(attrs),
        )
    }

    /// Sets the root and returns the computation id.
    pub fn finish(self, root: InstId) -> CompId {
        self.module.set_root(self.comp, root);
        self.comp
    }
}

/// Shape of the tuple produced by `copy_start` and `slice_start`:
/// `(destination, source, context)`.
pub fn async_start_shape(dst: Shape, src: Shape) -> Shape {
    Shape::tuple(vec![dst, src, Shape::scalar(PrimitiveType::U32)])
}

fn uncoloured(shape: &Shape) -> Shape {
    shape.recoloured(DEFAULT_MEMORY_SPACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_shapes() {
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let a = b.param("a", 0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let w = b.param("w", 1, Shape::array(PrimitiveType::F32, &[4, 2]));
        let d = b.dot("d", a, w);
        let r = b.reduce("r", d, 1);
        let t = b.tuple("t", &[d, r]);
        let g = b.get_tuple_element("g", t, 1);
        let cs = b.copy_start("cs", g, 1);
        let cd = b.async_done("cd", cs);

        assert_eq!(b.shape(d).to_string(), "f32[8,2]");
        assert_eq!(b.shape(r).to_string(), "f32[8]");
        assert_eq!(b.shape(g).to_string(), "f32[8]");
        assert_eq!(b.shape(cs).to_string(), "(f32[8]{S(1)}, f32[8], u32[])");
        assert_eq!(b.shape(cd).to_string(), "f32[8]{S(1)}");
        let main = b.finish(cd);
        mb.set_entry(main);

        let module = mb.build();
        let comp = &module.comps[main];
        assert_eq!(comp.params().len(), 2);
        assert_eq!(comp.sequence().len(), 8);
        assert_eq!(comp.inst_by_name("cd"), Some(cd));
        assert_eq!(comp.fresh_name("cd"), "cd.1");
    }
}
