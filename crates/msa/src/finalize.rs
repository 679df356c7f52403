//! Materialises allocations in the module.
//!
//! Copies become `copy_start`/`copy_done` pairs (or one `slice_start`/
//! `slice_done` pair per slice joined by a `slice_concat`) spliced into the
//! schedule of the copy's computation, uses served by a copy are rewired to
//! it, and values placed in alternate memory get their shapes coloured.
use ir::{
    builder::async_start_shape, Attrs, CompId, InstData, InstId, Module, Opcode, Position, Shape,
    ShapeIndex, DEFAULT_MEMORY_SPACE,
};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    algorithm::AllocationOutcome,
    allocation::{Allocation, AllocationId, AllocationKind},
    chunk::Chunk,
    live_range::LiveRanges,
    options::Options,
};

/// Offsets decided for the patched module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresetAssignments {
    /// Alternate-memory chunk of every position holding a value there.
    pub chunks: Vec<(Position, Chunk)>,
    pub scoped: Vec<(InstId, Chunk)>,
    /// Bytes of alternate memory in use, aligned.
    pub size: u64,
}

impl PresetAssignments {
    pub fn chunk_of(&self, position: &Position) -> Option<Chunk> {
        self.chunks
            .iter()
            .find_map(|(p, c)| (p == position).then_some(*c))
    }
}

type Result<T> = std::result::Result<T, crate::MsaError>;

struct Finalizer<'a> {
    module: &'a mut Module,
    live: &'a LiveRanges,
    options: &'a Options,
    /// Where the data of each allocation can be read from.
    producers: FxHashMap<AllocationId, Position>,
    /// Array leaves extracted from tuple positions.
    extracted: FxHashMap<Position, InstId>,
    /// Last copy start spliced after an instruction, so later ones follow it.
    after: FxHashMap<InstId, InstId>,
    cross_program: u32,
}

pub fn finalize(
    module: &mut Module,
    live: &LiveRanges,
    options: &Options,
    outcome: &AllocationOutcome,
) -> Result<PresetAssignments> {
    let mut f = Finalizer {
        module,
        live,
        options,
        producers: FxHashMap::default(),
        extracted: FxHashMap::default(),
        after: FxHashMap::default(),
        cross_program: 0,
    };

    f.colour(outcome);
    for (id, a) in outcome.allocations.iter() {
        let producer = match &a.kind {
            AllocationKind::Pinned | AllocationKind::Mirrored { .. } => a.position.clone(),
            AllocationKind::Copy {
                prev,
                start_after,
                done_before,
                cross_program,
            } => f.emit_copy(a, *prev, *start_after, *done_before, *cross_program)?,
            AllocationKind::SlicedCopy { prev, slices } => f.emit_sliced_copy(a, *prev, slices)?,
            AllocationKind::Parent { original } => f.emit_parent(a, *original)?,
        };
        f.producers.insert(id, producer);
    }

    for (id, a) in outcome.allocations.iter() {
        if matches!(a.kind, AllocationKind::Pinned | AllocationKind::Mirrored { .. }) {
            continue;
        }
        let producer = f.producer(a, id)?;
        let comp = f.module.comp_of(producer);
        let local: Vec<_> = a
            .uses
            .iter()
            .filter(|u| f.module.comp_of(u.inst) == comp)
            .collect();
        for u in local {
            f.rewire(u.inst, u.operand as usize, &u.index, producer);
        }
    }

    propagate_shapes(f.module);
    f.colour(outcome);

    let mut chunks = Vec::new();
    for (id, a) in outcome.allocations.iter() {
        let Some(chunk) = a.chunk else {
            continue;
        };
        if let Some(position) = f.producers.get(&id) {
            if !chunks.iter().any(|(p, _)| p == position) {
                chunks.push((position.clone(), chunk));
            }
        }
    }
    let used = chunks
        .iter()
        .map(|(_, c)| c.end())
        .chain(outcome.scoped.iter().map(|(_, c)| c.end()))
        .max()
        .unwrap_or(0);
    Ok(PresetAssignments {
        chunks,
        scoped: outcome.scoped.clone(),
        size: options.align(used),
    })
}

impl Finalizer<'_> {
    /// The array instruction holding the data of `id`, needed by `a`.
    fn producer(&mut self, a: &Allocation, id: AllocationId) -> Result<InstId> {
        let Some(position) = self.producers.get(&id).cloned() else {
            return Err(Self::fail(a, format!("{id} is read before it is materialised")));
        };
        Ok(self.extract(&position))
    }

    fn fail(a: &Allocation, reason: impl Into<String>) -> crate::MsaError {
        crate::MsaError::Finalization {
            value: a.value,
            inst: a.position.inst,
            reason: reason.into(),
        }
    }

    /// The instruction producing the array at `position`, inserting
    /// `get_tuple_element`s right after the tuple if needed.
    fn extract(&mut self, position: &Position) -> InstId {
        if position.index.is_empty() {
            return position.inst;
        }
        if let Some(&inst) = self.extracted.get(position) {
            return inst;
        }
        let comp = self.module.comp_of(position.inst);
        let mut cur = position.inst;
        let mut prefix = ShapeIndex::empty();
        for &i in position.index.iter() {
            prefix.push(i);
            let key = Position::new(position.inst, prefix.clone());
            cur = match self.extracted.get(&key) {
                Some(&inst) => inst,
                None => {
                    let gte = self.get_tuple_element(comp, cur, i, Placement::After(cur));
                    self.extracted.insert(key, gte);
                    gte
                }
            };
        }
        cur
    }

    fn get_tuple_element(&mut self, comp: CompId, tuple: InstId, i: u32, at: Placement) -> InstId {
        let shape = self
            .module
            .shape(tuple)
            .tuple_elements()
            .get(i as usize)
            .cloned()
            .unwrap_or_else(|| Shape::tuple(vec![]));
        let name = format!("{}.{i}", self.module.inst(tuple).name);
        let data = InstData::new(self.module.comps[comp].fresh_name(&name), Opcode::GetTupleElement, shape)
            .with_operands(&[tuple])
            .with_attrs(Attrs {
                index: Some(i),
                ..Default::default()
            });
        self.insert(comp, at, data)
    }

    fn insert(&mut self, comp: CompId, at: Placement, data: InstData) -> InstId {
        let sequence = self.module.comps[comp].sequence();
        let index = match at {
            Placement::After(inst) => sequence.iter().position(|&i| i == inst).map_or(0, |p| p + 1),
            Placement::Before(inst) => sequence
                .iter()
                .position(|&i| i == inst)
                .unwrap_or(sequence.len()),
            Placement::End => sequence.len(),
        };
        self.module.insert_inst(comp, index, data)
    }

    fn index_of(&self, comp: CompId, inst: InstId) -> Option<usize> {
        self.module.comps[comp].position_of(inst)
    }

    /// Splices a copy start after the last instruction of `comp` at or
    /// before `start_after`, and after `src`. Also returns the scheduled
    /// instruction the start is anchored to.
    fn place_start(&self, comp: CompId, start_after: i64, src: InstId) -> (Placement, Option<InstId>) {
        let key = self
            .live
            .last_time_in(&*self.module, comp, start_after)
            .map(|t| self.live.inst_at(t));
        let anchor = key.map(|a| self.after.get(&a).copied().unwrap_or(a));
        let src_index = self.index_of(comp, src);
        let at = match (anchor, src_index) {
            (Some(a), Some(s)) if self.index_of(comp, a) < Some(s) => Placement::After(src),
            (Some(a), _) => Placement::After(a),
            (None, Some(_)) => Placement::After(src),
            (None, None) => match self.module.comps[comp].sequence().first() {
                Some(&first) => Placement::Before(first),
                None => Placement::End,
            },
        };
        (at, key)
    }

    /// A copy done goes before the first instruction of `comp` at or after
    /// `done_before`.
    fn place_done(&self, comp: CompId, done_before: i64) -> Placement {
        match self.live.first_time_in(&*self.module, comp, done_before) {
            Some(t) => Placement::Before(self.live.inst_at(t)),
            None => Placement::End,
        }
    }

    fn check_order(&self, a: &Allocation, comp: CompId, start: InstId, done: InstId) -> Result<()> {
        match (self.index_of(comp, start), self.index_of(comp, done)) {
            (Some(s), Some(d)) if s < d => Ok(()),
            _ => Err(Self::fail(a, "copy done would precede its start")),
        }
    }

    fn emit_copy(
        &mut self,
        a: &Allocation,
        prev: AllocationId,
        start_after: i64,
        done_before: i64,
        cross_program: bool,
    ) -> Result<Position> {
        let src = self.producer(a, prev)?;
        let comp = a.home;
        let src_shape = self.module.shape(src).clone();
        let space = if a.is_alternate() {
            self.options.alternate_memory_space
        } else {
            DEFAULT_MEMORY_SPACE
        };
        let dst_shape = src_shape.recoloured(space);

        let mut attrs = Attrs::default();
        if cross_program {
            attrs.cross_program_prefetch = Some(self.cross_program);
            self.cross_program += 1;
        }
        let base = &self.module.inst(src).name;
        let start_name = self.module.comps[comp].fresh_name(&format!("{base}.copy_start"));
        let (at, key) = self.place_start(comp, start_after, src);
        let start = self.insert(
            comp,
            at,
            InstData::new(start_name, Opcode::CopyStart, async_start_shape(dst_shape.clone(), src_shape))
                .with_operands(&[src])
                .with_attrs(attrs),
        );
        if let Some(key) = key {
            self.after.insert(key, start);
        }

        let base = &self.module.inst(src).name;
        let done_name = self.module.comps[comp].fresh_name(&format!("{base}.copy_done"));
        let at = self.place_done(comp, done_before);
        let done = self.insert(
            comp,
            at,
            InstData::new(done_name, Opcode::CopyDone, dst_shape).with_operands(&[start]),
        );
        self.check_order(a, comp, start, done)?;
        debug!(value = %a.value, start_after, done_before, "emitted copy");
        Ok(Position::new(done, ShapeIndex::empty()))
    }

    fn emit_sliced_copy(
        &mut self,
        a: &Allocation,
        prev: AllocationId,
        slices: &[crate::allocation::SliceDetail],
    ) -> Result<Position> {
        let src = self.producer(a, prev)?;
        let comp = a.home;
        let src_shape = self.module.shape(src).clone();
        let space = self.options.alternate_memory_space;

        let mut dones = Vec::with_capacity(slices.len());
        let mut ordered: Vec<_> = slices.iter().collect();
        ordered.sort_by_key(|s| (s.start_after, s.chunk.offset));
        for slice in ordered {
            let mut dst = slice.proposal.shape.clone().with_memory_space(space);
            if let Some(update) = &self.options.sliced_prefetch.update_layout {
                update(&mut dst);
            }
            let dst = Shape::Array(dst);
            let base = &self.module.inst(src).name;
            let start_name = self.module.comps[comp].fresh_name(&format!("{base}.slice_start"));
            let (at, key) = self.place_start(comp, slice.start_after, src);
            let start = self.insert(
                comp,
                at,
                InstData::new(start_name, Opcode::SliceStart, async_start_shape(dst.clone(), src_shape.clone()))
                    .with_operands(&[src])
                    .with_attrs(Attrs {
                        slice: Some(slice.proposal.ranges.clone()),
                        ..Default::default()
                    }),
            );
            if let Some(key) = key {
                self.after.insert(key, start);
            }

            let base = &self.module.inst(src).name;
            let done_name = self.module.comps[comp].fresh_name(&format!("{base}.slice_done"));
            let at = self.place_done(comp, slice.done_before);
            let done = self.insert(
                comp,
                at,
                InstData::new(done_name, Opcode::SliceDone, dst).with_operands(&[start]),
            );
            self.check_order(a, comp, start, done)?;
            dones.push(done);
        }

        let Some(&last) = dones.last() else {
            return Err(Self::fail(a, "sliced copy without slices"));
        };
        let base = &self.module.inst(src).name;
        let name = self.module.comps[comp].fresh_name(&format!("{base}.concat"));
        let concat = self.insert(
            comp,
            Placement::After(last),
            InstData::new(name, Opcode::SliceConcat, src_shape.recoloured(space))
                .with_operands(&dones)
                .with_attrs(Attrs {
                    dim: Some(0),
                    ..Default::default()
                }),
        );
        debug!(value = %a.value, slices = dones.len(), "emitted sliced copy");
        Ok(Position::new(concat, ShapeIndex::empty()))
    }

    /// Appends the body's alternate-memory copy as an extra loop result and
    /// reads it after the loop.
    fn emit_parent(&mut self, a: &Allocation, original: AllocationId) -> Result<Position> {
        let w = a.position.inst;
        let comp = self.module.comp_of(w);
        let &[k] = a.position.index.iter().copied().collect::<Vec<_>>().as_slice() else {
            return Err(Self::fail(a, "loop result is not a top-level tuple element"));
        };
        let data = self.module.inst(w);
        let (Some(cond), Some(body)) = (data.while_condition(), data.while_body()) else {
            return Err(Self::fail(a, "parent allocation outside a loop"));
        };
        let Some(&init) = data.operands.first() else {
            return Err(Self::fail(a, "loop without operand"));
        };
        let Some(root) = self.module.comps[body].root() else {
            return Err(Self::fail(a, "loop body without root"));
        };
        if self.module.opcode(init) != Opcode::Tuple || self.module.opcode(root) != Opcode::Tuple {
            return Err(Self::fail(a, "loop carry is not a tuple"));
        }

        let carried = self.producer(a, original)?;
        let element = self.module.shape(carried).clone();
        let Some(&entering) = self.module.inst(init).operands.get(k as usize) else {
            return Err(Self::fail(a, "loop operand has no such element"));
        };
        let new_index = self.module.shape(w).tuple_elements().len() as u32;

        let entering_shape = self.module.shape(entering).clone();
        push_element(self.module, init, entering, entering_shape);
        push_element(self.module, root, carried, element.clone());
        append_tuple_shape(self.module.inst_mut(w), element.clone());
        for callee in [cond, body] {
            if let Some(&param) = self.module.comps[callee].params().first() {
                append_tuple_shape(self.module.inst_mut(param), element.clone());
            }
        }

        let gte = self.get_tuple_element(comp, w, new_index, Placement::After(w));
        trace!(value = %a.value, %gte, "loop result added");
        Ok(Position::new(gte, ShapeIndex::empty()))
    }

    /// Makes operand `operand` of `user` read `leaf` at `index`, rebuilding
    /// tuples around it as needed.
    fn rewire(&mut self, user: InstId, operand: usize, index: &ShapeIndex, leaf: InstId) {
        let Some(&current) = self.module.inst(user).operands.get(operand) else {
            return;
        };
        let comp = self.module.comp_of(user);
        let replacement = self.rebuild(comp, user, current, index, leaf);
        self.module.replace_operand(user, operand, replacement);
    }

    fn rebuild(&mut self, comp: CompId, user: InstId, tuple: InstId, index: &ShapeIndex, leaf: InstId) -> InstId {
        let Some(first) = index.first() else {
            return leaf;
        };
        let arity = self.module.shape(tuple).tuple_elements().len() as u32;
        let mut elements = Vec::with_capacity(arity as usize);
        for i in 0..arity {
            let element = self.get_tuple_element(comp, tuple, i, Placement::Before(user));
            if i == first {
                elements.push(self.rebuild(comp, user, element, &index.tail(), leaf));
            } else {
                elements.push(element);
            }
        }
        let shape = Shape::tuple(elements.iter().map(|&e| self.module.shape(e).clone()).collect());
        let name = format!("{}.rewired", self.module.inst(tuple).name);
        let data = InstData::new(self.module.comps[comp].fresh_name(&name), Opcode::Tuple, shape)
            .with_operands(&elements);
        self.insert(comp, Placement::Before(user), data)
    }

    fn colour(&mut self, outcome: &AllocationOutcome) {
        let space = self.options.alternate_memory_space;
        for (_, a) in outcome.allocations.iter() {
            if !a.is_alternate() || !matches!(a.kind, AllocationKind::Pinned) {
                continue;
            }
            let shape = &mut self.module.inst_mut(a.position.inst).shape;
            if let Some(leaf) = shape.leaf_mut(&a.position.index) {
                leaf.memory_space = space;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    After(InstId),
    Before(InstId),
    End,
}

fn push_element(module: &mut Module, tuple: InstId, element: InstId, shape: Shape) {
    let data = module.inst_mut(tuple);
    data.operands.push(element);
    append_tuple_shape(data, shape);
}

fn append_tuple_shape(data: &mut InstData, element: Shape) {
    if let Shape::Tuple(elems) = &mut data.shape {
        elems.push(element);
    }
}

/// Recomputes the shapes of instructions that only forward storage so
/// memory-space colours reach every position of a value.
fn propagate_shapes(module: &mut Module) {
    let insts: Vec<InstId> = module.comps.values().flat_map(|c| c.sequence().to_vec()).collect();
    let while_of: FxHashMap<CompId, InstId> = insts
        .iter()
        .filter(|&&i| module.opcode(i) == Opcode::While)
        .flat_map(|&i| module.inst(i).called.iter().map(move |&c| (c, i)).collect::<Vec<_>>())
        .collect();

    for _ in 0..=insts.len() {
        let mut changed = false;
        for &inst in &insts {
            let data = module.inst(inst);
            let shape = match data.opcode {
                Opcode::Tuple => Some(Shape::tuple(
                    data.operands.iter().map(|&op| module.shape(op).clone()).collect(),
                )),
                Opcode::GetTupleElement => data.operands.first().and_then(|&op| {
                    let i = data.attrs.index? as usize;
                    module.shape(op).tuple_elements().get(i).cloned()
                }),
                Opcode::Bitcast => match (data.operands.first().and_then(|&op| module.shape(op).as_array()), &data.shape) {
                    (Some(src), Shape::Array(_)) => Some(data.shape.recoloured(src.memory_space)),
                    _ => None,
                },
                Opcode::While => data
                    .while_body()
                    .and_then(|body| module.comps[body].root())
                    .map(|root| module.shape(root).clone()),
                Opcode::Parameter => while_of
                    .get(&data.comp())
                    .and_then(|&w| module.inst(w).operands.first())
                    .map(|&op| module.shape(op).clone()),
                _ => None,
            };
            if let Some(shape) = shape {
                if shape != module.inst(inst).shape {
                    module.inst_mut(inst).shape = shape;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;
    use ir::{BufferId, CallGraph, Dataflow, ModuleBuilder, PrimitiveType, ValueId};

    use super::*;
    use crate::allocation::MemorySpace;

    fn pinned(module: &Module, inst: InstId, space: MemorySpace, start: i64, end: i64) -> Allocation {
        let mut a = Allocation::pinned(
            ValueId::new(inst.index()),
            BufferId::new(inst.index()),
            Position::new(inst, ShapeIndex::empty()),
            module.comp_of(inst),
            space,
            (space == MemorySpace::Alternate).then(|| Chunk::new(0, 64)),
            start,
        );
        a.end = end;
        a
    }

    #[test]
    fn copies_are_spliced_and_uses_rewired() {
        let f = Shape::array(PrimitiveType::F32, &[16]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let p = b.param("p", 0, f);
        let a = b.unary("a", Opcode::Negate, p);
        let c = b.unary("c", Opcode::Exp, a);
        let d = b.binary("d", Opcode::Add, c, p);
        let main = b.finish(d);
        mb.set_entry(main);
        let mut module = mb.build();
        let df = Dataflow::analyze(&module);
        let cg = CallGraph::new(&module);
        let live = LiveRanges::new(&module, &df, &cg).unwrap();

        let mut outcome = AllocationOutcome::default();
        let src = outcome.allocations.push(pinned(&module, p, MemorySpace::Default, 0, 1));
        let mut copy = pinned(&module, p, MemorySpace::Alternate, 3, 3);
        copy.kind = AllocationKind::Copy {
            prev: src,
            start_after: 1,
            done_before: 3,
            cross_program: false,
        };
        copy.uses.push(ir::Use {
            inst: d,
            operand: 1,
            index: ShapeIndex::empty(),
        });
        outcome.allocations.push(copy);

        let preset = finalize(&mut module, &live, &Options::default(), &outcome).unwrap();
        let names: Vec<_> = module.comps[main]
            .sequence()
            .iter()
            .map(|&i| module.inst(i).name.to_string())
            .collect();
        assert_eq!(names, ["p", "a", "p.copy_start", "c", "p.copy_done", "d"]);

        let done = module.comps[main].inst_by_name("p.copy_done").unwrap();
        assert_eq!(module.inst(d).operands[1], done);
        assert_eq!(module.shape(done).as_array().unwrap().memory_space, 1);
        assert_eq!(preset.chunk_of(&Position::new(done, ShapeIndex::empty())), Some(Chunk::new(0, 64)));
        assert_eq!(preset.size, 64);
    }

    #[test]
    fn alternate_definitions_are_coloured_through_tuples() {
        let f = Shape::array(PrimitiveType::F32, &[16]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let p = b.param("p", 0, f);
        let a = b.unary("a", Opcode::Negate, p);
        let t = b.tuple("t", &[a, p]);
        let main = b.finish(t);
        mb.set_entry(main);
        let mut module = mb.build();
        let df = Dataflow::analyze(&module);
        let cg = CallGraph::new(&module);
        let live = LiveRanges::new(&module, &df, &cg).unwrap();

        let mut outcome = AllocationOutcome::default();
        outcome.allocations.push(pinned(&module, a, MemorySpace::Alternate, 1, 1));
        finalize(&mut module, &live, &Options::default(), &outcome).unwrap();

        let tuple = module.shape(t).tuple_elements();
        assert_eq!(tuple[0].as_array().unwrap().memory_space, 1);
        assert_eq!(tuple[1].as_array().unwrap().memory_space, 0);
    }
}
