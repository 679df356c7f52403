//! Logical times of the flattened schedule and value live ranges.
//!
//! The schedule of every computation reachable from the entry is flattened
//! into one sequence. A `while` contributes its condition and then its body
//! before the `while` itself; a `conditional` contributes each branch before
//! the `conditional`. The index of an instruction in that sequence is its
//! logical time.
use cranelift_entity::SecondaryMap;
use ir::{
    CallGraph, CompId, Dataflow, InstId, Module, Opcode, Position, Use, ValueId,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::MsaError;

#[derive(Debug)]
pub struct LiveRanges {
    flattened: Vec<InstId>,
    time: SecondaryMap<InstId, i64>,
    /// First flattened time of the computations called by a `while` or
    /// `conditional`.
    region_start: SecondaryMap<InstId, i64>,
    ranges: SecondaryMap<ValueId, (i64, i64)>,
    outputs: FxHashSet<ValueId>,
}

impl LiveRanges {
    pub fn new(
        module: &Module,
        dataflow: &Dataflow,
        call_graph: &CallGraph,
    ) -> Result<Self, MsaError> {
        validate_schedule(module, call_graph)?;

        let mut ranges = Self {
            flattened: Vec::new(),
            time: SecondaryMap::with_default(-1),
            region_start: SecondaryMap::with_default(-1),
            ranges: SecondaryMap::new(),
            outputs: FxHashSet::default(),
        };
        if let Some(entry) = module.entry() {
            ranges.flatten(module, entry);
            if let Some(root) = module.comps[entry].root() {
                ranges
                    .outputs
                    .extend(dataflow.values_at(root).iter().map(|(_, v)| *v));
            }
        }

        let last = ranges.schedule_end() - 1;
        for (v, data) in dataflow.values() {
            let start = ranges.time(data.defining.inst);
            let mut end = start;
            for pos in &data.positions {
                end = end.max(ranges.time(pos.inst));
            }
            for u in &data.uses {
                end = end.max(ranges.use_time(module, u));
            }
            if ranges.outputs.contains(&v) {
                end = end.max(last);
            }
            ranges.ranges[v] = (start, end);
        }
        Ok(ranges)
    }

    fn flatten(&mut self, module: &Module, comp: CompId) {
        for &inst in module.comps[comp].sequence() {
            let data = module.inst(inst);
            if data.opcode.calls_computations() {
                self.region_start[inst] = self.schedule_end();
                for &callee in &data.called {
                    self.flatten(module, callee);
                }
            }
            self.time[inst] = self.schedule_end();
            self.flattened.push(inst);
        }
    }

    /// One past the last logical time.
    pub fn schedule_end(&self) -> i64 {
        self.flattened.len() as i64
    }

    pub fn flattened(&self) -> &[InstId] {
        &self.flattened
    }

    pub fn time(&self, inst: InstId) -> i64 {
        self.time[inst]
    }

    pub fn is_scheduled(&self, inst: InstId) -> bool {
        self.time[inst] >= 0
    }

    pub fn inst_at(&self, time: i64) -> InstId {
        self.flattened[time as usize]
    }

    pub fn comp_at(&self, module: &Module, time: i64) -> CompId {
        module.comp_of(self.inst_at(time))
    }

    /// First flattened time of the computations called by `inst`, or the
    /// time of `inst` itself for instructions that call nothing.
    pub fn region_start(&self, module: &Module, inst: InstId) -> i64 {
        if module.opcode(inst).calls_computations() {
            self.region_start[inst]
        } else {
            self.time(inst)
        }
    }

    /// The time at which a use reads its operand. Loops and conditionals
    /// read their operands on entry.
    pub fn use_time(&self, module: &Module, u: &Use) -> i64 {
        self.region_start(module, u.inst)
    }

    /// `[definition time, last use or position time]`, inclusive.
    pub fn value_range(&self, v: ValueId) -> (i64, i64) {
        self.ranges[v]
    }

    /// Values visible at the root of the entry computation.
    pub fn is_output(&self, v: ValueId) -> bool {
        self.outputs.contains(&v)
    }

    /// Latest time not after `time` whose instruction is scheduled directly
    /// in `comp`.
    pub fn last_time_in(&self, module: &Module, comp: CompId, time: i64) -> Option<i64> {
        let upper = time.min(self.schedule_end() - 1);
        (0..=upper)
            .rev()
            .find(|&t| self.comp_at(module, t) == comp)
    }

    /// Earliest time not before `time` whose instruction is scheduled
    /// directly in `comp`.
    pub fn first_time_in(&self, module: &Module, comp: CompId, time: i64) -> Option<i64> {
        (time.max(0)..self.schedule_end()).find(|&t| self.comp_at(module, t) == comp)
    }
}

/// Rejects schedules the allocator cannot reason about: instructions that
/// appear twice or in the wrong computation, operands scheduled after their
/// user, and computations called more than once.
pub fn validate_schedule(module: &Module, call_graph: &CallGraph) -> Result<(), MsaError> {
    let Some(entry) = module.entry() else {
        return Err(MsaError::MalformedSchedule(
            "module has no entry computation".into(),
        ));
    };
    if call_graph.call_count(entry) != 0 {
        return Err(MsaError::MalformedSchedule(format!(
            "entry computation `%{}` is called",
            module.comps[entry].name
        )));
    }

    let mut seen = FxHashSet::default();
    for comp in module.post_order() {
        let data = &module.comps[comp];
        if comp != entry && call_graph.call_count(comp) != 1 {
            return Err(MsaError::MalformedSchedule(format!(
                "computation `%{}` is called {} times",
                data.name,
                call_graph.call_count(comp)
            )));
        }

        let mut order: FxHashMap<InstId, usize> = FxHashMap::default();
        for (i, &inst) in data.sequence().iter().enumerate() {
            let inst_data = module.inst(inst);
            if !seen.insert(inst) || module.comp_of(inst) != comp {
                return Err(MsaError::MalformedSchedule(format!(
                    "`{}` is scheduled more than once or outside its computation",
                    inst_data.name
                )));
            }
            for &op in &inst_data.operands {
                if !order.contains_key(&op) {
                    return Err(MsaError::MalformedSchedule(format!(
                        "operand `{}` of `{}` in `%{}` is not scheduled before its user",
                        module.inst(op).name,
                        inst_data.name,
                        data.name
                    )));
                }
            }
            if inst_data.opcode == Opcode::While && inst_data.called.len() != 2 {
                return Err(MsaError::MalformedSchedule(format!(
                    "`{}` must call a condition and a body",
                    inst_data.name
                )));
            }
            order.insert(inst, i);
        }

        match data.root() {
            Some(root) if order.contains_key(&root) => {}
            _ => {
                return Err(MsaError::MalformedSchedule(format!(
                    "root of `%{}` is not scheduled in it",
                    data.name
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ir::{ModuleBuilder, PrimitiveType, Shape, ShapeIndex};

    use super::*;

    #[test]
    fn loops_flatten_condition_then_body() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
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
        let a = b.param("a", 0, f);
        let e = b.unary("e", Opcode::Exp, a);
        let w = b.while_loop("w", e, cond, body);
        let r = b.unary("r", Opcode::Tanh, w);
        let main = b.finish(r);
        mb.set_entry(main);
        let module = mb.build();

        let df = Dataflow::analyze(&module);
        let cg = CallGraph::new(&module);
        let lr = LiveRanges::new(&module, &df, &cg).unwrap();

        // a e | p c | p n | w r
        assert_eq!(lr.schedule_end(), 8);
        assert_eq!(lr.time(a), 0);
        assert_eq!(lr.time(e), 1);
        assert_eq!(lr.time(n), 5);
        assert_eq!(lr.time(w), 6);
        assert_eq!(lr.time(r), 7);
        assert_eq!(lr.region_start(&module, w), 2);

        let ve = df.value_at(e, &ShapeIndex::empty()).unwrap();
        // Used by the loop on entry and visible in both loop computations.
        assert_eq!(lr.value_range(ve), (1, 5));
        let vn = df.value_at(n, &ShapeIndex::empty()).unwrap();
        assert_eq!(lr.value_range(vn), (5, 7));
        let vr = df.value_at(r, &ShapeIndex::empty()).unwrap();
        assert!(lr.is_output(vr));

        assert_eq!(lr.last_time_in(&module, main, 5), Some(1));
        assert_eq!(lr.first_time_in(&module, main, 2), Some(6));
        assert_eq!(lr.comp_at(&module, 4), body);
    }

    #[test]
    fn operand_after_user_is_rejected() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let a = b.param("a", 0, f);
        let n = b.unary("n", Opcode::Negate, a);
        let e = b.unary("e", Opcode::Exp, n);
        let main = b.finish(e);
        mb.set_entry(main);
        let mut module = mb.build();
        // Make `n` read `e`, which is scheduled after it.
        module.replace_operand(n, 0, e);

        let cg = CallGraph::new(&module);
        let err = validate_schedule(&module, &cg).unwrap_err();
        assert!(matches!(err, MsaError::MalformedSchedule(_)));
        assert!(err.to_string().contains("not scheduled before its user"));
    }
}
