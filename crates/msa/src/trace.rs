//! Heap-simulator trace of alternate-memory allocations.
use std::fmt;

use ir::{BufferId, ValueId};

use crate::{allocation::AllocationSequence, chunk::Chunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapEventKind {
    Alloc,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEvent {
    pub kind: HeapEventKind,
    pub time: i64,
    pub buffer: BufferId,
    pub value: ValueId,
    pub chunk: Chunk,
}

impl fmt::Display for HeapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HeapEventKind::Alloc => "alloc",
            HeapEventKind::Free => "free",
        };
        write!(
            f,
            "{:>5} {kind:<5} {} {} {}",
            self.time, self.buffer, self.value, self.chunk
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapTrace {
    pub events: Vec<HeapEvent>,
}

impl HeapTrace {
    /// One `Alloc` when a chunk becomes reserved and one `Free` the step
    /// after it is released. At equal times frees come first.
    pub fn from_allocations(allocations: &AllocationSequence) -> Self {
        let mut events = Vec::new();
        for (_, a) in allocations.iter() {
            for (start, end, chunk) in a.occupied() {
                let event = |kind, time| HeapEvent {
                    kind,
                    time,
                    buffer: a.buffer,
                    value: a.value,
                    chunk,
                };
                events.push(event(HeapEventKind::Alloc, start));
                events.push(event(HeapEventKind::Free, end + 1));
            }
        }
        events.sort_by_key(|e| (e.time, e.kind == HeapEventKind::Alloc, e.chunk.offset));
        Self { events }
    }

    /// Largest number of bytes reserved at once.
    pub fn peak(&self) -> u64 {
        let mut live = 0u64;
        let mut peak = 0;
        for e in &self.events {
            match e.kind {
                HeapEventKind::Alloc => {
                    live += e.chunk.size;
                    peak = peak.max(live);
                }
                HeapEventKind::Free => live = live.saturating_sub(e.chunk.size),
            }
        }
        peak
    }

    /// Highest byte offset reserved.
    pub fn footprint(&self) -> u64 {
        self.events.iter().map(|e| e.chunk.end()).max().unwrap_or(0)
    }
}

impl fmt::Display for HeapTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.events.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;
    use ir::{CompId, InstId, Position, ShapeIndex};

    use super::*;
    use crate::allocation::{Allocation, MemorySpace};

    fn alternate(value: usize, start: i64, end: i64, offset: u64) -> Allocation {
        let mut a = Allocation::pinned(
            ValueId::new(value),
            BufferId::new(value),
            Position::new(InstId::new(value), ShapeIndex::empty()),
            CompId::new(0),
            MemorySpace::Alternate,
            Some(Chunk::new(offset, 64)),
            start,
        );
        a.end = end;
        a
    }

    #[test]
    fn frees_come_before_allocations() {
        let mut allocations = AllocationSequence::default();
        allocations.push(alternate(0, 0, 3, 0));
        allocations.push(alternate(1, 4, 6, 0));
        allocations.push(alternate(2, 2, 5, 64));

        let trace = HeapTrace::from_allocations(&allocations);
        let kinds: Vec<_> = trace.events.iter().map(|e| (e.time, e.kind)).collect();
        assert_eq!(kinds[2], (4, HeapEventKind::Free));
        assert_eq!(kinds[3], (4, HeapEventKind::Alloc));
        assert_eq!(trace.peak(), 128);
        assert_eq!(trace.footprint(), 128);
    }
}
