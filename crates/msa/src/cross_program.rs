//! Prefetches of entry parameters that overlap the previous run of the
//! program.
//!
//! The copy of a chosen parameter starts before the first instruction, so
//! its chunk is reserved from time 0. When the parameter is dead for a
//! large enough tail of the program, the chunk is released after the last
//! use and a second copy refills it by the end, ready for the next run.
use ir::{BufferId, Opcode, ValueId};
use tracing::debug;

use crate::{
    algorithm::MsaAlgorithm,
    allocation::{Allocation, AllocationKind, CopyKind, MemorySpace},
    chunk::{Chunk, ChunkPiece},
    error::AllocationResult,
};

impl MsaAlgorithm<'_> {
    /// Entry parameter leaves worth prefetching across runs, largest first.
    pub(crate) fn cross_program_candidates(&self) -> Vec<(BufferId, ValueId)> {
        let module = self.cx.module;
        let dataflow = self.cx.dataflow;
        let Some(entry) = module.entry() else {
            return Vec::new();
        };

        let mut candidates: Vec<(u64, BufferId, ValueId)> = Vec::new();
        for &param in module.comps[entry].params() {
            for &(_, value) in dataflow.values_at(param) {
                let data = dataflow.value(value);
                let size = self.options.size_of(data);
                let buffer = self.cx.alias.buffer_of(value);
                let eligible = !data.uses.is_empty()
                    && size > 0
                    && size <= self.options.max_size_bytes
                    && data.shape.memory_space != self.options.alternate_memory_space
                    && self.options.value_allowed(module, data)
                    && self.cx.alias.values(buffer).len() == 1
                    && !self.cx.live.is_output(value)
                    && data.uses.iter().all(|u| {
                        !matches!(module.opcode(u.inst), Opcode::While | Opcode::Conditional)
                            && self.options.use_allowed(module, u)
                            && self.cx.live.is_scheduled(u.inst)
                    });
                if eligible {
                    candidates.push((size, buffer, value));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.cmp(&b.2)));
        candidates.into_iter().map(|(_, b, v)| (b, v)).collect()
    }

    pub(crate) fn allocate_cross_program_prefetches(&mut self) {
        let mut placed = 0;
        for (buffer, value) in self.cross_program_candidates() {
            if placed >= self.options.max_cross_program_prefetches {
                break;
            }
            let cp = self.checkpoint();
            match self.cross_program_prefetch(value) {
                Ok(()) => {
                    self.commit();
                    self.done_buffers.insert(buffer);
                    placed += 1;
                }
                Err(result) => {
                    debug!(%value, %result, "no cross-program prefetch");
                    self.rollback(cp);
                }
            }
        }
    }

    fn cross_program_prefetch(&mut self, value: ValueId) -> Result<(), AllocationResult> {
        let module = self.cx.module;
        let live = self.cx.live;
        let dataflow = self.cx.dataflow;
        let data = dataflow.value(value);
        let size = self.options.size_of(data);
        let buffer = self.cx.alias.buffer_of(value);
        let home = module.comp_of(data.defining.inst);
        let (start, _) = live.value_range(value);
        let end = live.schedule_end();

        let mut uses = data.uses.clone();
        uses.sort_by_key(|u| (live.use_time(module, u), u.clone()));
        let first_use = uses.first().map_or(start, |u| live.use_time(module, u));
        let last_use = uses.last().map_or(start, |u| live.use_time(module, u));
        let amount = self.cx.cost.async_copy_elapsed(size);

        if self.prefetch_tracker.would_exceed(&[(-1, first_use)]) {
            return Err(AllocationResult::FAIL_OUT_OF_ASYNC_COPIES);
        }
        let offset = self
            .find_chunk(&[ChunkPiece::whole(0, last_use, size)], None, &[])
            .ok_or(AllocationResult::FAIL_OUT_OF_MEMORY)?;
        if !self.prefetch_resource.has_enough(-1, first_use, amount) {
            return Err(AllocationResult::FAIL_VIOLATES_ASYNC_COPY_RESOURCE);
        }
        let chunk = Chunk::new(offset, size);

        let mut source = Allocation::pinned(
            value,
            buffer,
            data.defining.clone(),
            home,
            MemorySpace::Default,
            None,
            start,
        );
        source.end = end - 1;
        let source = self.push_allocation(source);

        let copy = Allocation {
            value,
            buffer,
            position: data.defining.clone(),
            home,
            space: MemorySpace::Alternate,
            chunk: Some(chunk),
            start: first_use,
            end: last_use,
            uses,
            kind: AllocationKind::Copy {
                prev: source,
                start_after: -1,
                done_before: first_use,
                cross_program: true,
            },
        };
        let copy = self.push_allocation(copy);
        self.claim_copy(CopyKind::Prefetch, &[(-1, first_use, amount)]);

        let tail = (end - last_use) as f64 / end.max(1) as f64;
        if tail >= self.options.cross_program_prefetch_free_tail_ratio && last_use + 1 < end {
            let start_after = self
                .picker
                .preferred_prefetch_start_time(size, last_use + 1, end - 1, end)
                .clamp(last_use + 1, end - 1);
            let piece = ChunkPiece::whole(start_after + 1, end, size);
            let fits = !self.prefetch_tracker.would_exceed(&[(start_after, end)])
                && self.find_chunk(&[piece], Some(offset), &[copy]) == Some(offset)
                && self.prefetch_resource.has_enough(start_after, end, amount);
            if fits {
                let refill = Allocation {
                    value,
                    buffer,
                    position: data.defining.clone(),
                    home,
                    space: MemorySpace::Alternate,
                    chunk: Some(chunk),
                    start: end,
                    end,
                    uses: Vec::new(),
                    kind: AllocationKind::Copy {
                        prev: source,
                        start_after,
                        done_before: end,
                        cross_program: true,
                    },
                };
                let refill = self.push_allocation(refill);
                self.claim_copy(CopyKind::Prefetch, &[(start_after, end, amount)]);
                self.aliased.union(copy, refill);
                debug!(%value, offset, last_use, start_after, "cross-program prefetch with free tail");
                return Ok(());
            }
        }

        // Keep the chunk to the end so the next run finds the value in place.
        if !self.can_extend(copy, end, &[]) {
            return Err(AllocationResult::FAIL_OUT_OF_MEMORY);
        }
        self.extend(copy, end);
        debug!(%value, offset, "cross-program prefetch");
        Ok(())
    }
}
