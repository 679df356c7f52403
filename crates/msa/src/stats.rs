use std::fmt;

use crate::allocation::{AllocationKind, AllocationSequence, CopyKind};

/// Counters describing what the pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub allocations: usize,
    pub prefetches: usize,
    pub sliced_prefetches: usize,
    pub slices: usize,
    pub evictions: usize,
    pub cross_program_prefetches: usize,
    pub parent_allocations: usize,
    pub bytes_prefetched: u64,
    pub bytes_evicted: u64,
    pub max_outstanding_prefetches: i64,
    pub max_outstanding_evictions: i64,
    pub repacks_attempted: u32,
    pub repacks_accepted: u32,
    pub buffers_in_default: usize,
    pub retries: u32,
}

impl Stats {
    /// Fills the counters derived from the final allocation sequence.
    pub fn record_allocations(&mut self, allocations: &AllocationSequence) {
        self.allocations = allocations.len();
        for (_, a) in allocations.iter() {
            let bytes = a.chunk.map_or(0, |c| c.size);
            match (&a.kind, a.copy_kind()) {
                (AllocationKind::SlicedCopy { slices, .. }, _) => {
                    self.prefetches += 1;
                    self.sliced_prefetches += 1;
                    self.slices += slices.len();
                    self.bytes_prefetched += bytes;
                }
                (AllocationKind::Copy { cross_program, .. }, Some(CopyKind::Prefetch)) => {
                    self.prefetches += 1;
                    self.bytes_prefetched += bytes;
                    if *cross_program {
                        self.cross_program_prefetches += 1;
                    }
                }
                (AllocationKind::Copy { .. }, Some(CopyKind::Eviction)) => {
                    self.evictions += 1;
                    if let Some(prev) = a.prev() {
                        self.bytes_evicted += allocations[prev].chunk.map_or(0, |c| c.size);
                    }
                }
                (AllocationKind::Parent { .. }, _) => self.parent_allocations += 1,
                _ => {}
            }
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "allocations: {}", self.allocations)?;
        writeln!(
            f,
            "prefetches: {} ({} sliced into {} slices, {} cross-program), {} bytes",
            self.prefetches,
            self.sliced_prefetches,
            self.slices,
            self.cross_program_prefetches,
            self.bytes_prefetched
        )?;
        writeln!(f, "evictions: {}, {} bytes", self.evictions, self.bytes_evicted)?;
        writeln!(f, "parent allocations: {}", self.parent_allocations)?;
        writeln!(
            f,
            "max outstanding: {} prefetches, {} evictions",
            self.max_outstanding_prefetches, self.max_outstanding_evictions
        )?;
        writeln!(
            f,
            "repacks: {} attempted, {} accepted",
            self.repacks_attempted, self.repacks_accepted
        )?;
        write!(
            f,
            "buffers in default memory: {}, retries: {}",
            self.buffers_in_default, self.retries
        )
    }
}
