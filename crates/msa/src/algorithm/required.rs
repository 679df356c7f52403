//! Placement constraints the allocator must honour.
use indexmap::IndexMap;
use ir::{AliasAnalysis, Dataflow, Module, Opcode, ValueId, DEFAULT_MEMORY_SPACE};

use crate::{
    allocation::{AllocationId, MemorySpace},
    live_range::LiveRanges,
};

/// "At `time`, `value` lives in `space`", optionally at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredAssignment {
    pub value: ValueId,
    pub time: i64,
    pub space: MemorySpace,
    pub offset: Option<u64>,
    /// Allocation whose chunk the value takes over in place.
    pub aliased_with: Option<AllocationId>,
}

/// Required assignments by value. Assignments added while a buffer is being
/// allocated are logged so they can be dropped with the buffer.
#[derive(Debug, Clone, Default)]
pub struct RequiredAssignments {
    by_value: IndexMap<ValueId, Vec<RequiredAssignment>>,
    log: Vec<ValueId>,
}

impl RequiredAssignments {
    pub fn add(&mut self, required: RequiredAssignment) {
        let list = self.by_value.entry(required.value).or_default();
        if list.contains(&required) {
            return;
        }
        list.push(required);
        self.log.push(required.value);
    }

    pub fn of(&self, value: ValueId) -> &[RequiredAssignment] {
        self.by_value.get(&value).map_or(&[], Vec::as_slice)
    }

    /// The assignment of `value` at exactly `time`. A default-memory
    /// requirement wins over an alternate one at the same time.
    pub fn at(&self, value: ValueId, time: i64) -> Option<RequiredAssignment> {
        let mut found: Option<RequiredAssignment> = None;
        for r in self.of(value).iter().filter(|r| r.time == time) {
            match found {
                Some(f) if f.space == MemorySpace::Default => {}
                _ => found = Some(*r),
            }
        }
        found
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequiredAssignment> {
        self.by_value.values().flatten()
    }

    pub fn checkpoint(&self) -> usize {
        self.log.len()
    }

    pub fn rollback(&mut self, checkpoint: usize) {
        while self.log.len() > checkpoint {
            let Some(value) = self.log.pop() else {
                break;
            };
            if let Some(list) = self.by_value.get_mut(&value) {
                list.pop();
            }
        }
    }

    /// Requirements implied by the program itself: entry parameters and
    /// constants start in default memory, program outputs end there, and
    /// values whose shape is already coloured with the alternate space are
    /// defined there.
    pub fn from_program(
        module: &Module,
        dataflow: &Dataflow,
        live: &LiveRanges,
        alternate_memory_space: i64,
    ) -> Self {
        let mut required = Self::default();
        let entry = module.entry();
        for (v, data) in dataflow.values() {
            let def = data.defining.inst;
            let (start, end) = live.value_range(v);
            let opcode = module.opcode(def);
            let is_input = opcode == Opcode::Constant
                || (opcode == Opcode::Parameter && Some(module.comp_of(def)) == entry);
            if is_input {
                required.add(RequiredAssignment {
                    value: v,
                    time: start,
                    space: MemorySpace::Default,
                    offset: None,
                    aliased_with: None,
                });
            } else if data.shape.memory_space == alternate_memory_space
                && alternate_memory_space != DEFAULT_MEMORY_SPACE
            {
                required.add(RequiredAssignment {
                    value: v,
                    time: start,
                    space: MemorySpace::Alternate,
                    offset: None,
                    aliased_with: None,
                });
            }
            if live.is_output(v) {
                required.add(RequiredAssignment {
                    value: v,
                    time: end,
                    space: MemorySpace::Default,
                    offset: None,
                    aliased_with: None,
                });
            }
        }
        required.log.clear();
        required
    }
}

/// Values that must stay in default memory for their whole life: every value
/// in the buffer of a `conditional` result.
pub fn default_only_values(
    module: &Module,
    dataflow: &Dataflow,
    alias: &AliasAnalysis,
) -> Vec<ValueId> {
    let mut out = Vec::new();
    for (inst, data) in module.insts.iter() {
        if data.opcode != Opcode::Conditional {
            continue;
        }
        for (_, v) in dataflow.values_at(inst) {
            out.extend_from_slice(alias.values(alias.buffer_of(*v)));
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;

    use super::*;

    fn req(value: u32, time: i64, space: MemorySpace) -> RequiredAssignment {
        RequiredAssignment {
            value: ValueId::new(value as usize),
            time,
            space,
            offset: None,
            aliased_with: None,
        }
    }

    #[test]
    fn rollback_drops_logged_assignments() {
        let mut required = RequiredAssignments::default();
        required.add(req(0, 1, MemorySpace::Alternate));
        let cp = required.checkpoint();
        required.add(req(0, 1, MemorySpace::Default));
        required.add(req(1, 4, MemorySpace::Default));
        required.add(req(1, 4, MemorySpace::Default));
        assert_eq!(required.iter().count(), 3);
        assert_eq!(
            required.at(ValueId::new(0), 1).map(|r| r.space),
            Some(MemorySpace::Default)
        );

        required.rollback(cp);
        assert_eq!(required.iter().count(), 1);
        assert_eq!(
            required.at(ValueId::new(0), 1).map(|r| r.space),
            Some(MemorySpace::Alternate)
        );
        assert!(required.at(ValueId::new(1), 4).is_none());
    }
}
