//! Serving individual reads and placement constraints of a value.
use ir::{CompId, Opcode, Position, ShapeIndex, Use, ValueId};
use tracing::{debug, trace};

use super::{MsaAlgorithm, Request};
use crate::{
    allocation::{Allocation, AllocationId, AllocationKind, CopyKind, MemorySpace, SliceDetail},
    chunk::{Chunk, ChunkPiece},
    copy_resource::CopySpec,
    error::AllocationResult,
    picker::PrefetchWindow,
    slicing::{propose_major_dim_slices, slice_start_times, SliceProposal},
};

type Outcome<T> = Result<T, AllocationResult>;

/// A feasible prefetch found during the window search.
enum Plan {
    Whole { start_after: i64, offset: u64 },
    Sliced { offset: u64, slices: Vec<SliceDetail> },
}

impl MsaAlgorithm<'_> {
    /// Creates the allocation at the definition of `value`.
    pub(super) fn define(
        &mut self,
        value: ValueId,
        size: u64,
        default_only: bool,
        requests: &[(i64, Request)],
    ) -> Outcome<()> {
        let data = self.cx.dataflow.value(value);
        let position = data.defining.clone();
        let home = self.cx.module.comp_of(position.inst);
        let (start, end) = self.cx.live.value_range(value);
        let buffer = self.cx.alias.buffer_of(value);
        let at_def = self.required.at(value, start);

        let pinned = |space, chunk| Allocation::pinned(value, buffer, position.clone(), home, space, chunk, start);

        if default_only || at_def.is_some_and(|r| r.space == MemorySpace::Default) {
            if at_def.is_some_and(|r| r.space == MemorySpace::Alternate) {
                return Err(AllocationResult::FAIL_REQUIRES_UNCOMMIT);
            }
            self.push_allocation(pinned(MemorySpace::Default, None));
            return Ok(());
        }

        // An offset some later requirement pins the value to.
        let target = self
            .required
            .of(value)
            .iter()
            .filter(|r| r.space == MemorySpace::Alternate && r.offset.is_some())
            .min_by_key(|r| r.time)
            .copied();
        let ignore = target
            .and_then(|r| r.aliased_with)
            .map(|a| self.aliased.members(a))
            .unwrap_or_default();
        let preferred = at_def.and_then(|r| r.offset).or(target.and_then(|r| r.offset));

        if let Some(required) = at_def {
            let piece = ChunkPiece::whole(start, start, size);
            let offset = self
                .find_chunk(&[piece], required.offset, &ignore)
                .filter(|&o| required.offset.map_or(true, |r| r == o))
                .ok_or(AllocationResult::FAIL_OUT_OF_MEMORY | AllocationResult::FAIL_REQUIRES_UNCOMMIT)?;
            let id = self.push_allocation(pinned(MemorySpace::Alternate, Some(Chunk::new(offset, size))));
            if let Some(with) = required.aliased_with {
                self.aliased.union(id, with);
            }
            return Ok(());
        }

        // Stay in alternate memory until the first request if that fits
        // without a copy.
        let first = requests.first().map_or(end, |(t, _)| *t).max(start);
        let first_needs_default = requests.first().is_some_and(|(_, r)| match r {
            Request::Use(u) => !self.use_in_alternate(u),
            Request::Required(r) => r.space == MemorySpace::Default,
        });
        if !first_needs_default && self.picker.can_allocate_in_alternate_memory_no_copy(size, start, first) {
            let piece = ChunkPiece::whole(start, first, size);
            if let Some(offset) = self.find_chunk(&[piece], preferred, &ignore) {
                let mut allocation = pinned(MemorySpace::Alternate, Some(Chunk::new(offset, size)));
                allocation.end = first;
                let id = self.push_allocation(allocation);
                trace!(%value, offset, start, first, "defined in alternate memory");
                if let Some(r) = target.filter(|r| r.offset == Some(offset)) {
                    if let Some(with) = r.aliased_with {
                        self.aliased.union(id, with);
                    }
                }
                return Ok(());
            }
        }
        self.push_allocation(pinned(MemorySpace::Default, None));
        Ok(())
    }

    fn use_in_alternate(&self, u: &Use) -> bool {
        self.options.use_allowed(self.cx.module, u)
            && !self.forced_default.contains(u)
            && self.cx.module.opcode(u.inst) != Opcode::Conditional
    }

    pub(super) fn serve_use(
        &mut self,
        value: ValueId,
        size: u64,
        default_only: bool,
        time: i64,
        comp: CompId,
        u: Use,
    ) -> Outcome<()> {
        let id = if default_only || !self.use_in_alternate(&u) {
            self.ensure_default(value, time, comp)?
        } else {
            self.ensure_any(value, size, time, comp, &u)?
        };
        self.allocations[id].uses.push(u.clone());

        let module = self.cx.module;
        match module.opcode(u.inst) {
            Opcode::While => {
                let while_time = self.cx.live.time(u.inst);
                if !self.can_extend(id, while_time, &[]) {
                    return Err(AllocationResult::FAIL_OUT_OF_MEMORY | AllocationResult::FAIL_REQUIRES_UNCOMMIT);
                }
                self.extend(id, while_time);
                // The loop result in the body must end where the value
                // entered the loop.
                let Some(body) = module.inst(u.inst).while_body() else {
                    return Ok(());
                };
                let Some(root) = module.comps[body].root() else {
                    return Ok(());
                };
                let Some(carried) = self.cx.dataflow.value_at(root, &u.index) else {
                    return Ok(());
                };
                if carried != value {
                    self.require_in_place(carried, self.cx.live.time(root), id);
                }
            }
            Opcode::DynamicUpdateSlice if u.operand == 0 => {
                if let Some(out) = self.cx.dataflow.value_at(u.inst, &ShapeIndex::empty()) {
                    self.require_in_place(out, self.cx.live.time(u.inst), id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Requires `value` at `time` wherever allocation `with` lives.
    fn require_in_place(&mut self, value: ValueId, time: i64, with: AllocationId) {
        let allocation = &self.allocations[with];
        self.required.add(super::RequiredAssignment {
            value,
            time,
            space: allocation.space,
            offset: allocation.chunk.map(|c| c.offset),
            aliased_with: allocation.is_alternate().then_some(with),
        });
    }

    /// An allocation readable at `time` in `comp`, creating the one that
    /// exposes a loop result if needed.
    fn current_or_entry(&mut self, value: ValueId, time: i64, comp: CompId) -> Outcome<AllocationId> {
        if let Some(id) = self.current(value, time, comp) {
            return Ok(id);
        }
        self.loop_result_allocation(value, time, comp)
            .ok_or(AllocationResult::FAIL_REQUIRES_UNCOMMIT)?
    }

    /// For a value defined in a loop body and read after the loop, the
    /// allocation at the `while` result. It shares the location the value
    /// has when the body ends.
    fn loop_result_allocation(
        &mut self,
        value: ValueId,
        time: i64,
        comp: CompId,
    ) -> Option<Outcome<AllocationId>> {
        let module = self.cx.module;
        let live = self.cx.live;
        let position = self
            .cx
            .dataflow
            .value(value)
            .positions
            .iter()
            .filter(|p| {
                module.opcode(p.inst) == Opcode::While
                    && module.comp_of(p.inst) == comp
                    && live.is_scheduled(p.inst)
                    && live.time(p.inst) <= time
            })
            .max_by_key(|p| live.time(p.inst))?
            .clone();
        let body = module.inst(position.inst).while_body()?;
        let root = module.comps[body].root()?;
        Some(self.enter_from_body(value, position, body, live.time(root)))
    }

    fn enter_from_body(
        &mut self,
        value: ValueId,
        position: Position,
        body: CompId,
        root_time: i64,
    ) -> Outcome<AllocationId> {
        let inner = self.current_or_entry(value, root_time, body)?;
        if !self.can_extend(inner, root_time, &[]) {
            return Err(AllocationResult::FAIL_OUT_OF_MEMORY | AllocationResult::FAIL_REQUIRES_UNCOMMIT);
        }
        self.extend(inner, root_time);

        let while_time = self.cx.live.time(position.inst);
        let home = self.cx.module.comp_of(position.inst);
        let (space, chunk) = (self.allocations[inner].space, self.allocations[inner].chunk);
        if let Some(chunk) = chunk {
            let ignore = self.aliased.members(inner);
            let piece = ChunkPiece::whole(while_time, while_time, chunk.size);
            if self.find_chunk(&[piece], Some(chunk.offset), &ignore) != Some(chunk.offset) {
                return Err(AllocationResult::FAIL_OUT_OF_MEMORY | AllocationResult::FAIL_REQUIRES_UNCOMMIT);
            }
        }
        let id = self.push_allocation(Allocation::pinned(
            value,
            self.cx.alias.buffer_of(value),
            position,
            home,
            space,
            chunk,
            while_time,
        ));
        if chunk.is_some() {
            self.aliased.union(id, inner);
        }
        Ok(id)
    }

    /// Makes `value` readable from default memory at `time`.
    pub(super) fn ensure_default(&mut self, value: ValueId, time: i64, comp: CompId) -> Outcome<AllocationId> {
        let cur = self.current_or_entry(value, time, comp)?;
        if self.allocations[cur].is_default() {
            self.extend(cur, time);
            return Ok(cur);
        }
        // Values are immutable: any earlier default copy is still valid.
        if let Some(d) = self.current_default(value, time, comp) {
            self.extend(d, time);
            return Ok(d);
        }
        if self.allocations[cur].home != comp {
            return Err(AllocationResult::FAIL_REQUIRES_UNCOMMIT);
        }
        self.evict(value, cur, time, comp)
    }

    /// Copies the alternate-memory allocation `src` out to default memory,
    /// done by `time`.
    fn evict(&mut self, value: ValueId, src: AllocationId, time: i64, comp: CompId) -> Outcome<AllocationId> {
        let module = self.cx.module;
        let size = self.options.size_of(self.cx.dataflow.value(value));
        let amount = self.cx.cost.async_copy_elapsed(size);
        let mut result = AllocationResult::SUCCESS;

        for start_after in self.allocations[src].end..time {
            if start_after >= 0 && self.cx.live.comp_at(module, start_after) != comp {
                continue;
            }
            if !self.can_extend(src, start_after + 1, &[]) {
                result |= AllocationResult::FAIL_OUT_OF_MEMORY;
                break;
            }
            let preferred = self
                .picker
                .preferred_eviction_end_time(size, start_after, time)
                .clamp(start_after + 1, time);
            let mut ends = vec![preferred];
            if preferred != time {
                ends.push(time);
            }
            for done_before in ends {
                if done_before < time && self.cx.live.comp_at(module, done_before) != comp {
                    continue;
                }
                if self.eviction_tracker.would_exceed(&[(start_after, done_before)]) {
                    result |= AllocationResult::FAIL_OUT_OF_ASYNC_COPIES;
                    continue;
                }
                if !self.can_extend(src, done_before, &[]) {
                    result |= AllocationResult::FAIL_OUT_OF_MEMORY;
                    continue;
                }
                if !self.eviction_resource.has_enough(start_after, done_before, amount) {
                    result |= AllocationResult::FAIL_VIOLATES_ASYNC_COPY_RESOURCE;
                    continue;
                }

                self.extend(src, done_before);
                let allocation = Allocation {
                    value,
                    buffer: self.cx.alias.buffer_of(value),
                    position: self.allocations[src].position.clone(),
                    home: comp,
                    space: MemorySpace::Default,
                    chunk: None,
                    start: done_before,
                    end: time,
                    uses: Vec::new(),
                    kind: AllocationKind::Copy {
                        prev: src,
                        start_after,
                        done_before,
                        cross_program: false,
                    },
                };
                let id = self.push_allocation(allocation);
                self.claim_copy(CopyKind::Eviction, &[(start_after, done_before, amount)]);
                debug!(%value, start_after, done_before, "eviction");
                return Ok(id);
            }
        }
        if result.is_success() {
            result = AllocationResult::FAIL_LIVE_RANGE_TOO_SHORT;
        }
        Err(result | AllocationResult::FAIL_REQUIRES_UNCOMMIT)
    }

    /// Makes `value` readable at `time`, preferring alternate memory.
    pub(super) fn ensure_any(
        &mut self,
        value: ValueId,
        size: u64,
        time: i64,
        comp: CompId,
        u: &Use,
    ) -> Outcome<AllocationId> {
        let cur = self.current_or_entry(value, time, comp)?;
        let covering = self.allocations[cur].end >= time;

        if self.allocations[cur].is_alternate() {
            if covering {
                return Ok(cur);
            }
            let start = self.allocations[cur].start;
            if self.picker.can_allocate_in_alternate_memory_no_copy(size, start, time)
                && self.can_extend(cur, time, &[])
            {
                self.extend(cur, time);
                return Ok(cur);
            }
            let default = match self.current_default(value, time, comp) {
                Some(d) => d,
                None if self.allocations[cur].home == comp => match self.evict(value, cur, time, comp) {
                    Ok(d) => d,
                    Err(result) if self.can_extend(cur, time, &[]) => {
                        trace!(%value, %result, "eviction failed, keeping value in place");
                        self.extend(cur, time);
                        return Ok(cur);
                    }
                    Err(result) => return Err(result),
                },
                None => return Err(AllocationResult::FAIL_REQUIRES_UNCOMMIT),
            };
            return Ok(self.prefetch_or_default(value, size, default, time, comp, u));
        }

        if let Some(parent) = self.try_parent_allocation(value, time, comp) {
            return Ok(parent);
        }
        Ok(self.prefetch_or_default(value, size, cur, time, comp, u))
    }

    fn prefetch_or_default(
        &mut self,
        value: ValueId,
        size: u64,
        default: AllocationId,
        time: i64,
        comp: CompId,
        u: &Use,
    ) -> AllocationId {
        match self.prefetch(value, size, default, time, comp, Some(u), None, None) {
            Ok(id) => id,
            Err(result) => {
                trace!(%value, time, %result, "prefetch failed");
                self.extend(default, time);
                default
            }
        }
    }

    /// Places `value` in alternate memory at `time`, optionally at a fixed
    /// offset shared with `aliased_with`.
    pub(super) fn ensure_alternate(
        &mut self,
        value: ValueId,
        size: u64,
        time: i64,
        comp: CompId,
        offset: Option<u64>,
        aliased_with: Option<AllocationId>,
    ) -> Outcome<AllocationId> {
        let uncommit = AllocationResult::FAIL_REQUIRES_UNCOMMIT;
        let cur = self.current_or_entry(value, time, comp)?;
        let also_ignore = aliased_with.map(|a| self.aliased.members(a)).unwrap_or_default();

        if let Some(chunk) = self.allocations[cur].chunk {
            if offset.is_some_and(|o| o != chunk.offset) {
                return Err(AllocationResult::FAIL_CONFLICTING_PREFERRED_OFFSETS | uncommit);
            }
            if !self.can_extend(cur, time, &also_ignore) {
                return Err(AllocationResult::FAIL_OUT_OF_MEMORY | uncommit);
            }
            self.extend(cur, time);
            if let Some(with) = aliased_with {
                self.aliased.union(cur, with);
            }
            return Ok(cur);
        }

        let default = self.current_default(value, time, comp).unwrap_or(cur);
        self.prefetch(value, size, default, time, comp, None, offset, aliased_with)
            .map_err(|result| result | uncommit)
    }

    /// Prefetches `value` from the default-memory allocation `src` so that
    /// it is in alternate memory by `time`.
    #[allow(clippy::too_many_arguments)]
    fn prefetch(
        &mut self,
        value: ValueId,
        size: u64,
        src: AllocationId,
        time: i64,
        comp: CompId,
        u: Option<&Use>,
        offset: Option<u64>,
        aliased_with: Option<AllocationId>,
    ) -> Outcome<AllocationId> {
        let module = self.cx.module;
        let live = self.cx.live;

        // A default allocation of an enclosing computation is mirrored into
        // this one before it can be copied from.
        let mirror = if self.allocations[src].home == comp {
            None
        } else {
            let position = self
                .cx
                .dataflow
                .value(value)
                .positions
                .iter()
                .filter(|p| {
                    module.comp_of(p.inst) == comp
                        && live.is_scheduled(p.inst)
                        && live.time(p.inst) <= time
                })
                .min_by_key(|p| live.time(p.inst))
                .cloned()
                .ok_or(AllocationResult::FAIL_PREV_ALLOCATION_NOT_IN_ALTERNATE_MEM)?;
            Some(position)
        };
        let window_start = match &mirror {
            Some(p) => live.time(p.inst),
            None => self.allocations[src].start,
        };
        if time <= window_start {
            return Err(AllocationResult::FAIL_LIVE_RANGE_TOO_SHORT);
        }

        let use_savings = u.map_or(0.0, |u| self.cx.cost.use_savings(u.inst, u.operand, &u.index));
        let latest = self
            .picker
            .latest_prefetch_start_time(size, window_start, time, use_savings);
        if latest < window_start {
            return Err(AllocationResult::FAIL_LIVE_RANGE_TOO_SHORT);
        }
        let preferred = u.and_then(|u| self.preferred_start(u, size, window_start, latest, time));
        self.picker.begin(&PrefetchWindow {
            size,
            start: window_start,
            end: time,
            preferred,
            use_savings,
        });

        let ignore = aliased_with.map(|a| self.aliased.members(a)).unwrap_or_default();
        let proposals = self.slice_proposals(value, size);
        let mut result = AllocationResult::SUCCESS;
        let mut whole: Option<Plan> = None;
        let mut chosen = None;
        while !self.picker.done() {
            let start_after = self.picker.next();
            if start_after >= time
                || (start_after > window_start && live.comp_at(module, start_after) != comp)
            {
                continue;
            }
            if let Some(proposals) = &proposals {
                match self.check_sliced(start_after, time, proposals, offset, &ignore) {
                    Ok(plan) => {
                        chosen = Some(plan);
                        break;
                    }
                    Err(r) => result |= r,
                }
            }
            if whole.is_none() {
                match self.check_whole(start_after, time, size, offset, &ignore) {
                    Ok(found) => {
                        whole = Some(Plan::Whole {
                            start_after,
                            offset: found,
                        });
                        if proposals.is_none() {
                            break;
                        }
                    }
                    Err(r) => result |= r,
                }
            }
        }
        let Some(plan) = chosen.or(whole) else {
            if result.is_success() {
                result = AllocationResult::FAIL_LIVE_RANGE_TOO_SHORT;
            }
            return Err(result);
        };

        // Commit the plan.
        let source = match mirror {
            Some(position) => {
                let mut allocation = Allocation::pinned(
                    value,
                    self.cx.alias.buffer_of(value),
                    position,
                    comp,
                    MemorySpace::Default,
                    None,
                    window_start,
                );
                allocation.kind = AllocationKind::Mirrored { original: src };
                self.push_allocation(allocation)
            }
            None => src,
        };
        let position = self.allocations[source].position.clone();
        let buffer = self.cx.alias.buffer_of(value);
        let (kind, chunk, windows) = match plan {
            Plan::Whole { start_after, offset } => (
                AllocationKind::Copy {
                    prev: source,
                    start_after,
                    done_before: time,
                    cross_program: false,
                },
                Chunk::new(offset, size),
                vec![(start_after, time, self.cx.cost.async_copy_elapsed(size))],
            ),
            Plan::Sliced { offset, slices } => {
                let windows = slices
                    .iter()
                    .map(|s| (s.start_after, s.done_before, self.cx.cost.async_copy_elapsed(s.chunk.size)))
                    .collect();
                (
                    AllocationKind::SlicedCopy { prev: source, slices },
                    Chunk::new(offset, size),
                    windows,
                )
            }
        };
        // The source stays readable until the last slice has started.
        let last_start = windows.iter().map(|w| w.0).max().unwrap_or(window_start);
        self.extend(source, last_start);
        let id = self.push_allocation(Allocation {
            value,
            buffer,
            position,
            home: comp,
            space: MemorySpace::Alternate,
            chunk: Some(chunk),
            start: time,
            end: time,
            uses: Vec::new(),
            kind,
        });
        self.claim_copy(CopyKind::Prefetch, &windows);
        if let Some(with) = aliased_with {
            self.aliased.union(id, with);
        }
        debug!(%value, last_start_after = last_start, done_before = time, offset = chunk.offset, slices = windows.len(), "prefetch");
        Ok(id)
    }

    fn check_whole(
        &self,
        start_after: i64,
        done_before: i64,
        size: u64,
        offset: Option<u64>,
        ignore: &[AllocationId],
    ) -> Outcome<u64> {
        if self.prefetch_tracker.would_exceed(&[(start_after, done_before)]) {
            return Err(AllocationResult::FAIL_OUT_OF_ASYNC_COPIES);
        }
        if self.options.enforce_prefetch_fifo_order
            && self.prefetch_tracker.violates_fifo(start_after, done_before)
        {
            return Err(AllocationResult::FAIL_VIOLATES_FIFO);
        }
        let piece = ChunkPiece::whole(start_after + 1, done_before, size);
        let found = self
            .find_chunk(&[piece], offset, ignore)
            .filter(|&o| offset.map_or(true, |p| p == o))
            .ok_or(AllocationResult::FAIL_OUT_OF_MEMORY)?;
        let amount = self.cx.cost.async_copy_elapsed(size);
        if !self.prefetch_resource.has_enough(start_after, done_before, amount) {
            return Err(AllocationResult::FAIL_VIOLATES_ASYNC_COPY_RESOURCE);
        }
        Ok(found)
    }

    fn check_sliced(
        &self,
        start_after: i64,
        done_before: i64,
        proposals: &[SliceProposal],
        offset: Option<u64>,
        ignore: &[AllocationId],
    ) -> Outcome<Plan> {
        let sizes: Vec<u64> = proposals.iter().map(SliceProposal::size).collect();
        let latest = self.picker.latest_time().clamp(start_after, done_before - 1);
        let starts = slice_start_times(&sizes, start_after, latest);
        if starts.iter().all(|&s| s == starts[0]) {
            return Err(AllocationResult::ALL_SLICES_HAVE_THE_SAME_START_TIME);
        }

        let windows: Vec<(i64, i64)> = starts.iter().map(|&s| (s, done_before)).collect();
        if self.prefetch_tracker.would_exceed(&windows) {
            return Err(AllocationResult::FAIL_OUT_OF_ASYNC_COPIES);
        }
        if self.options.enforce_prefetch_fifo_order
            && windows.iter().any(|&(s, d)| self.prefetch_tracker.violates_fifo(s, d))
        {
            return Err(AllocationResult::FAIL_VIOLATES_FIFO);
        }

        let mut pieces = Vec::with_capacity(sizes.len());
        let mut at = 0;
        for (&start, &size) in starts.iter().zip(&sizes) {
            pieces.push(ChunkPiece {
                start: start + 1,
                end: done_before,
                offset: at,
                size,
            });
            at += size;
        }
        let base = self
            .find_chunk(&pieces, offset, ignore)
            .filter(|&o| offset.map_or(true, |p| p == o))
            .ok_or(AllocationResult::FAIL_OUT_OF_MEMORY)?;

        let specs: Vec<CopySpec> = starts
            .iter()
            .zip(&sizes)
            .map(|(&s, &size)| CopySpec {
                start_after: s,
                done_before,
                amount: self.cx.cost.async_copy_elapsed(size),
            })
            .collect();
        if !self.prefetch_resource.has_enough_multi(&specs) {
            return Err(AllocationResult::FAIL_VIOLATES_ASYNC_COPY_RESOURCE);
        }

        let slices = pieces
            .iter()
            .zip(&starts)
            .zip(proposals)
            .map(|((piece, &start_after), proposal)| SliceDetail {
                start_after,
                done_before,
                chunk: Chunk::new(base + piece.offset, piece.size),
                proposal: proposal.clone(),
            })
            .collect();
        Ok(Plan::Sliced { offset: base, slices })
    }

    fn slice_proposals(&self, value: ValueId, size: u64) -> Option<Vec<SliceProposal>> {
        let sliced = &self.options.sliced_prefetch;
        if !sliced.is_enabled() || size < sliced.min_bytes {
            return None;
        }
        let shape = &self.cx.dataflow.value(value).shape;
        let proposals = match &sliced.propose {
            Some(propose) => propose(shape, sliced.max_slices),
            None => propose_major_dim_slices(shape, sliced.max_slices),
        }?;
        let total: u64 = proposals.iter().map(SliceProposal::size).sum();
        (proposals.len() >= 2 && total == size).then_some(proposals)
    }

    /// Preferred start time of a prefetch for `u`: the loop optimizer's
    /// schedule first, then the user's filter rules.
    fn preferred_start(&self, u: &Use, size: u64, earliest: i64, latest: i64, end: i64) -> Option<i64> {
        if let Some(&t) = self.preferred_starts.get(u) {
            return Some(t.clamp(earliest, latest));
        }
        let module = self.cx.module;
        let from_filter = self
            .options
            .filter_update_preferred_prefetches
            .iter()
            .filter(|rule| rule.matches(module, u, size))
            .find_map(|rule| rule.preferred_time(module, self.cx.live, u, earliest, latest));
        if let Some(t) = from_filter {
            return Some(t.clamp(earliest, latest));
        }
        Some(self.picker.preferred_prefetch_start_time(size, earliest, latest, end))
    }

    /// A loop-invariant value prefetched inside a loop body is kept in
    /// alternate memory after the loop through an extra loop result.
    fn try_parent_allocation(&mut self, value: ValueId, time: i64, comp: CompId) -> Option<AllocationId> {
        if !self.options.enable_while_parent_allocations {
            return None;
        }
        let module = self.cx.module;
        let live = self.cx.live;
        let dataflow = self.cx.dataflow;

        // The latest loop over `value` finished before `time` in `comp`.
        let position = dataflow
            .value(value)
            .positions
            .iter()
            .filter(|p| {
                module.opcode(p.inst) == Opcode::While
                    && module.comp_of(p.inst) == comp
                    && live.is_scheduled(p.inst)
                    && live.time(p.inst) < time
            })
            .max_by_key(|p| live.time(p.inst))?
            .clone();
        let w = position.inst;
        let data = module.inst(w);
        let body = data.while_body()?;
        let root = module.comps[body].root()?;
        let init = *data.operands.first()?;
        let users_are_gtes = module.comps[comp].sequence().iter().all(|&i| {
            let user = module.inst(i);
            !user.operands.contains(&w) || user.opcode == Opcode::GetTupleElement
        });
        if module.opcode(init) != Opcode::Tuple
            || module.opcode(root) != Opcode::Tuple
            || module.comps[comp].root() == Some(w)
            || !users_are_gtes
            || dataflow.value_at(root, &position.index) != Some(value)
        {
            return None;
        }

        let original = self
            .allocations
            .ids_from(self.committed)
            .filter(|&id| {
                let a = &self.allocations[id];
                a.value == value && a.home == body && a.is_alternate() && a.is_copy()
            })
            .last()?;
        let chunk = self.allocations[original].chunk?;
        let root_time = live.time(root);
        let while_time = live.time(w);
        if !self.can_extend(original, root_time, &[]) {
            return None;
        }
        let ignore = self.aliased.members(original);
        let piece = ChunkPiece::whole(while_time, time, chunk.size);
        if self.find_chunk(&[piece], Some(chunk.offset), &ignore) != Some(chunk.offset) {
            return None;
        }

        self.extend(original, root_time);
        let mut allocation = Allocation::pinned(
            value,
            self.cx.alias.buffer_of(value),
            position,
            comp,
            MemorySpace::Alternate,
            Some(chunk),
            while_time,
        );
        allocation.end = time;
        allocation.kind = AllocationKind::Parent { original };
        let id = self.push_allocation(allocation);
        self.aliased.union(id, original);
        debug!(%value, while_time, "kept in alternate memory after loop");
        Some(id)
    }
}
