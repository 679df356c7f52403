//! Buffer-by-buffer allocation.
//!
//! Buffers are visited in decreasing order of benefit. All values of a
//! buffer are allocated together: allocations made for the buffer stay
//! pending until every value succeeded and are rolled back as a whole
//! otherwise.
mod required;
mod segment;

use cranelift_entity::EntityRef;
use ir::{
    AliasAnalysis, BufferId, CallGraph, CompId, Dataflow, InstId, Module, Opcode, Use, ValueId,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

pub use required::{default_only_values, RequiredAssignment, RequiredAssignments};

use crate::{
    allocation::{AliasedOffsets, Allocation, AllocationId, AllocationSequence, CopyKind, MemorySpace},
    async_copy::AsyncCopyTracker,
    chunk::{Chunk, ChunkFinder, ChunkPiece},
    copy_resource::{CopyKey, CopyResource},
    cost::CostModel,
    error::{AllocationResult, MsaError},
    interval_tree::IntervalTree,
    live_range::LiveRanges,
    options::{Options, PickerKind},
    picker::{CostAnalysisPicker, InstructionCountPicker, PrefetchIntervalPicker},
    stats::Stats,
};

/// What reserves a chunk in the interval tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Allocation(AllocationId),
    Scoped(InstId),
}

/// Analyses of the module shared by every stage of the pass.
#[derive(Clone, Copy)]
pub struct Analyses<'a> {
    pub module: &'a Module,
    pub dataflow: &'a Dataflow,
    pub alias: &'a AliasAnalysis,
    pub call_graph: &'a CallGraph,
    pub live: &'a LiveRanges,
    pub cost: &'a CostModel<'a>,
}

/// Everything the allocator decided.
#[derive(Debug, Default)]
pub struct AllocationOutcome {
    pub allocations: AllocationSequence,
    pub aliased: AliasedOffsets,
    pub required: RequiredAssignments,
    pub scoped: Vec<(InstId, Chunk)>,
    pub prefetch_windows: Vec<(i64, i64)>,
    pub eviction_windows: Vec<(i64, i64)>,
    pub stats: Stats,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    allocations: usize,
    aliased: usize,
    prefetches: usize,
    evictions: usize,
    required: usize,
    ledger: usize,
}

/// A read or a placement constraint of one value, in time order.
#[derive(Debug, Clone)]
pub(crate) enum Request {
    Use(Use),
    Required(RequiredAssignment),
}

pub struct MsaAlgorithm<'a> {
    pub(crate) cx: Analyses<'a>,
    pub(crate) options: &'a Options,
    pub(crate) picker: Box<dyn PrefetchIntervalPicker + 'a>,
    pub(crate) finder: ChunkFinder,

    pub(crate) allocations: AllocationSequence,
    /// Allocations before this index are committed.
    pub(crate) committed: usize,
    pub(crate) aliased: AliasedOffsets,
    pub(crate) tree: IntervalTree<Occupant>,
    pub(crate) scoped: Vec<(InstId, Chunk)>,

    pub(crate) prefetch_resource: CopyResource,
    pub(crate) eviction_resource: CopyResource,
    /// Copies added to the resources since the last commit.
    pub(crate) ledger: Vec<(CopyKind, CopyKey)>,
    pub(crate) prefetch_tracker: AsyncCopyTracker,
    pub(crate) eviction_tracker: AsyncCopyTracker,

    pub(crate) required: RequiredAssignments,
    pub(crate) default_only: FxHashSet<ValueId>,
    pub(crate) forced_default: FxHashSet<Use>,
    pub(crate) preferred_starts: FxHashMap<Use, i64>,
    pub(crate) done_buffers: FxHashSet<BufferId>,

    pub(crate) failures_since_repack: u32,
    pub(crate) stats: Stats,
}

impl<'a> MsaAlgorithm<'a> {
    pub fn new(cx: Analyses<'a>, options: &'a Options) -> Self {
        let picker: Box<dyn PrefetchIntervalPicker + 'a> = match options.picker {
            PickerKind::InstructionCount => Box::new(InstructionCountPicker::from_options(options)),
            PickerKind::CostAnalysis => Box::new(CostAnalysisPicker::new(
                cx.module,
                cx.cost,
                cx.live,
                cx.call_graph,
                options,
            )),
        };

        let budget: Vec<f64> = cx
            .live
            .flattened()
            .iter()
            .map(|&inst| cx.cost.elapsed_default(inst))
            .collect();

        Self {
            cx,
            options,
            picker,
            finder: ChunkFinder {
                max_size: options.max_size_bytes,
                alignment: options.alignment_bytes,
            },
            allocations: AllocationSequence::default(),
            committed: 0,
            aliased: AliasedOffsets::default(),
            tree: IntervalTree::default(),
            scoped: Vec::new(),
            prefetch_resource: CopyResource::new(budget.clone()),
            eviction_resource: CopyResource::new(budget),
            ledger: Vec::new(),
            prefetch_tracker: AsyncCopyTracker::new(options.max_outstanding_prefetches),
            eviction_tracker: AsyncCopyTracker::new(options.max_outstanding_evictions),
            required: RequiredAssignments::from_program(
                cx.module,
                cx.dataflow,
                cx.live,
                options.alternate_memory_space,
            ),
            default_only: default_only_values(cx.module, cx.dataflow, cx.alias)
                .into_iter()
                .collect(),
            forced_default: FxHashSet::default(),
            preferred_starts: FxHashMap::default(),
            done_buffers: FxHashSet::default(),
            failures_since_repack: 0,
            stats: Stats::default(),
        }
    }

    /// Start times proposed for prefetches serving particular uses.
    pub fn with_preferred_starts(mut self, preferred: FxHashMap<Use, i64>) -> Self {
        self.preferred_starts = preferred;
        self
    }

    pub fn run(mut self) -> Result<AllocationOutcome, MsaError> {
        self.reserve_scoped_memory()?;
        if self.options.enable_cross_program_prefetch {
            self.allocate_cross_program_prefetches();
        }

        for buffer in self.buffer_order() {
            if self.done_buffers.contains(&buffer) {
                continue;
            }
            self.allocate_buffer(buffer)?;
        }

        let mut stats = std::mem::take(&mut self.stats);
        stats.record_allocations(&self.allocations);
        stats.max_outstanding_prefetches = self.prefetch_tracker.max_outstanding();
        stats.max_outstanding_evictions = self.eviction_tracker.max_outstanding();
        Ok(AllocationOutcome {
            allocations: self.allocations,
            aliased: self.aliased,
            required: self.required,
            scoped: self.scoped,
            prefetch_windows: self.prefetch_tracker.copies().to_vec(),
            eviction_windows: self.eviction_tracker.copies().to_vec(),
            stats,
        })
    }

    fn reserve_scoped_memory(&mut self) -> Result<(), MsaError> {
        if self.options.reserved_scoped_memory.is_none() {
            return Ok(());
        }
        for (t, &inst) in self.cx.live.flattened().iter().enumerate() {
            let size = self.options.scoped_memory(self.cx.module, inst);
            if size == 0 {
                continue;
            }
            if size > self.options.max_size_bytes {
                return Err(MsaError::invalid_option(
                    "reserved_scoped_memory",
                    format!(
                        "`{}` reserves {size} bytes, more than the alternate memory",
                        self.cx.module.inst(inst).name
                    ),
                ));
            }
            let chunk = Chunk::new(0, size);
            self.tree
                .insert(t as i64, t as i64, chunk, Occupant::Scoped(inst));
            self.scoped.push((inst, chunk));
        }
        Ok(())
    }

    /// Buffers by decreasing benefit, then decreasing size, then id. Buffers
    /// named by the autotuning order come first.
    fn buffer_order(&self) -> Vec<BufferId> {
        let mut intervals: Vec<(BufferId, f64, u64)> = self
            .cx
            .alias
            .buffers()
            .map(|(b, values)| {
                let benefit = values.iter().map(|&v| self.cx.cost.benefit(v)).sum();
                let size = values
                    .iter()
                    .map(|&v| self.options.size_of(self.cx.dataflow.value(v)))
                    .max()
                    .unwrap_or(0);
                (b, benefit, size)
            })
            .collect();
        intervals.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        let mut order: Vec<BufferId> = intervals.into_iter().map(|(b, ..)| b).collect();

        if let Some(first) = &self.options.autotuning_config {
            let mut tuned: Vec<BufferId> = first
                .iter()
                .map(|&n| BufferId::from_u32(n))
                .filter(|b| order.contains(b))
                .collect();
            tuned.dedup();
            order.retain(|b| !tuned.contains(b));
            tuned.extend(order);
            order = tuned;
        }
        order
    }

    fn allocate_buffer(&mut self, buffer: BufferId) -> Result<(), MsaError> {
        let mut values: Vec<ValueId> = self.cx.alias.values(buffer).to_vec();
        values.sort_by_key(|&v| (self.cx.live.value_range(v).0, v));

        let mut retry = 0;
        loop {
            self.picker.set_retry_number(retry);
            let cp = self.checkpoint();
            let result = values
                .iter()
                .try_for_each(|&v| self.allocate_value(v));
            match result {
                Ok(()) => {
                    let offending = self.inefficient_uses(cp.allocations);
                    if offending.is_empty() {
                        debug!(%buffer, allocations = self.allocations.len() - cp.allocations, "allocated buffer");
                        self.commit();
                        return Ok(());
                    }
                    debug!(%buffer, uses = offending.len(), "prefetches too inefficient, forcing default");
                    self.rollback(cp);
                    self.forced_default.extend(offending);
                }
                Err(result) => {
                    self.rollback(cp);
                    debug!(%buffer, %result, retry, "buffer allocation failed");
                    self.failures_since_repack += 1;
                    if self.failures_since_repack >= self.options.repack_trigger
                        && self.stats.repacks_attempted < self.options.max_repacks
                    {
                        self.failures_since_repack = 0;
                        self.repack();
                    }
                    if retry >= self.options.max_retries {
                        break;
                    }
                    retry += 1;
                    self.stats.retries += 1;
                }
            }
        }

        for &v in &values {
            let required_alternate = self
                .required
                .of(v)
                .iter()
                .find(|r| r.space == MemorySpace::Alternate);
            if let Some(r) = required_alternate {
                return Err(MsaError::RequiredAssignmentUnsatisfiable {
                    value: v,
                    time: r.time,
                });
            }
        }
        warn!(%buffer, "buffer placed in default memory");
        for &v in &values {
            self.pin_default(v);
        }
        self.stats.buffers_in_default += 1;
        self.commit();
        Ok(())
    }

    /// Places `value` in default memory for its whole life.
    pub(crate) fn pin_default(&mut self, value: ValueId) {
        let data = self.cx.dataflow.value(value);
        let (start, end) = self.cx.live.value_range(value);
        let mut allocation = Allocation::pinned(
            value,
            self.cx.alias.buffer_of(value),
            data.defining.clone(),
            self.cx.module.comp_of(data.defining.inst),
            MemorySpace::Default,
            None,
            start,
        );
        allocation.end = end;
        allocation.uses = data.uses.clone();
        self.push_allocation(allocation);
    }

    fn allocate_value(&mut self, value: ValueId) -> Result<(), AllocationResult> {
        let data = self.cx.dataflow.value(value);
        let size = self.options.size_of(data);
        let default_only = self.default_only.contains(&value)
            || size == 0
            || size > self.options.max_size_bytes
            || !self.options.value_allowed(self.cx.module, data)
            || !self.options.position_allowed(self.cx.module, &data.defining);

        let requests = self.requests(value);
        self.define(value, size, default_only, &requests)?;
        for (time, request) in requests {
            let comp = self.cx.live.comp_at(self.cx.module, time);
            match request {
                Request::Use(u) => self.serve_use(value, size, default_only, time, comp, u)?,
                Request::Required(r) => match r.space {
                    MemorySpace::Default => {
                        self.ensure_default(value, time, comp)?;
                    }
                    MemorySpace::Alternate => {
                        self.ensure_alternate(value, size, time, comp, r.offset, r.aliased_with)?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Uses and required assignments of `value` by time. Requirements come
    /// before uses at the same time.
    fn requests(&self, value: ValueId) -> Vec<(i64, Request)> {
        let module = self.cx.module;
        let live = self.cx.live;
        let mut requests: Vec<(i64, u8, Request)> = Vec::new();
        for u in &self.cx.dataflow.value(value).uses {
            if !live.is_scheduled(u.inst) {
                continue;
            }
            requests.push((live.use_time(module, u), 1, Request::Use(u.clone())));
        }
        for r in self.required.of(value) {
            requests.push((r.time, 0, Request::Required(*r)));
        }
        requests.sort_by(|a, b| {
            (a.0, a.1).cmp(&(b.0, b.1)).then_with(|| match (&a.2, &b.2) {
                (Request::Use(x), Request::Use(y)) => x.cmp(y),
                _ => std::cmp::Ordering::Equal,
            })
        });
        requests.into_iter().map(|(t, _, r)| (t, r)).collect()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            allocations: self.allocations.len(),
            aliased: self.aliased.checkpoint(),
            prefetches: self.prefetch_tracker.len(),
            evictions: self.eviction_tracker.len(),
            required: self.required.checkpoint(),
            ledger: self.ledger.len(),
        }
    }

    pub(crate) fn rollback(&mut self, cp: Checkpoint) {
        self.allocations.truncate(cp.allocations);
        self.aliased.rollback(cp.aliased, cp.allocations);
        self.prefetch_tracker.truncate(cp.prefetches);
        self.eviction_tracker.truncate(cp.evictions);
        self.required.rollback(cp.required);
        while self.ledger.len() > cp.ledger {
            match self.ledger.pop() {
                Some((CopyKind::Prefetch, key)) => self.prefetch_resource.remove(key),
                Some((CopyKind::Eviction, key)) => self.eviction_resource.remove(key),
                None => break,
            }
        }
    }

    /// Moves pending alternate-memory allocations into the interval tree.
    pub(crate) fn commit(&mut self) {
        for id in self.allocations.ids_from(self.committed) {
            for (start, end, chunk) in self.allocations[id].occupied() {
                self.tree.insert(start, end, chunk, Occupant::Allocation(id));
            }
        }
        self.committed = self.allocations.len();
        self.ledger.clear();
    }

    pub(crate) fn push_allocation(&mut self, allocation: Allocation) -> AllocationId {
        let id = self.allocations.push(allocation);
        self.aliased.grow(id);
        id
    }

    /// Lowest base offset at which every piece fits, looking at committed
    /// and pending allocations except those in `ignore`.
    pub(crate) fn find_chunk(
        &self,
        pieces: &[ChunkPiece],
        preferred_offset: Option<u64>,
        ignore: &[AllocationId],
    ) -> Option<u64> {
        let lo = pieces.iter().map(|p| p.start).min()?;
        let hi = pieces.iter().map(|p| p.end).max()?;
        let mut occupied: Vec<(i64, i64, Chunk)> = self
            .tree
            .query(lo, hi)
            .into_iter()
            .filter(|(.., occupant)| match occupant {
                Occupant::Allocation(id) => !ignore.contains(id),
                Occupant::Scoped(_) => true,
            })
            .map(|(s, e, c, _)| (s, e, c))
            .collect();
        for id in self.allocations.ids_from(self.committed) {
            if ignore.contains(&id) {
                continue;
            }
            occupied.extend(
                self.allocations[id]
                    .occupied()
                    .into_iter()
                    .filter(|(s, e, _)| *s <= hi && lo <= *e),
            );
        }
        self.finder.find(&occupied, pieces, preferred_offset)
    }

    /// Returns `true` if the chunk of `id` is also free over
    /// `(end, new_end]`.
    pub(crate) fn can_extend(&self, id: AllocationId, new_end: i64, also_ignore: &[AllocationId]) -> bool {
        let allocation = &self.allocations[id];
        let Some(chunk) = allocation.chunk else {
            return true;
        };
        if new_end <= allocation.end {
            return true;
        }
        let mut ignore = self.aliased.members(id);
        ignore.extend_from_slice(also_ignore);
        let piece = ChunkPiece::whole(allocation.end + 1, new_end, chunk.size);
        self.find_chunk(&[piece], Some(chunk.offset), &ignore) == Some(chunk.offset)
    }

    pub(crate) fn extend(&mut self, id: AllocationId, new_end: i64) {
        let allocation = &mut self.allocations[id];
        allocation.end = allocation.end.max(new_end);
    }

    /// The allocation of `value` that a read at `time` in `comp` sees: the
    /// most recent one among those homed closest to `comp`.
    pub(crate) fn current(&self, value: ValueId, time: i64, comp: CompId) -> Option<AllocationId> {
        let depth = |c: CompId| {
            let mut depth = 0;
            let mut cur = c;
            while let Some(caller) = self.cx.call_graph.caller(cur) {
                depth += 1;
                cur = caller;
            }
            depth
        };
        self.allocations
            .ids_from(self.committed)
            .filter(|&id| {
                let a = &self.allocations[id];
                a.value == value && a.start <= time && self.cx.call_graph.is_ancestor(a.home, comp)
            })
            .max_by_key(|&id| (depth(self.allocations[id].home), id.index()))
    }

    /// The most recent default-memory allocation of `value` readable at
    /// `time` in `comp`.
    pub(crate) fn current_default(&self, value: ValueId, time: i64, comp: CompId) -> Option<AllocationId> {
        self.allocations
            .ids_from(self.committed)
            .filter(|&id| {
                let a = &self.allocations[id];
                a.value == value
                    && a.is_default()
                    && a.start <= time
                    && self.cx.call_graph.is_ancestor(a.home, comp)
            })
            .max_by_key(|&id| (self.allocations[id].end, id.index()))
    }

    /// Uses served by prefetches that read too few bytes for what the
    /// prefetch copies.
    fn inefficient_uses(&self, from: usize) -> Vec<Use> {
        let threshold = self.options.inefficient_use_to_copy_ratio;
        if threshold <= 0.0 {
            return Vec::new();
        }
        let module = self.cx.module;
        let mut offending = Vec::new();
        for id in self.allocations.ids_from(from) {
            let a = &self.allocations[id];
            if a.copy_kind() != Some(CopyKind::Prefetch) || a.is_cross_program_prefetch() {
                continue;
            }
            let size = self.options.size_of(self.cx.dataflow.value(a.value)) as f64;
            let copied = size * self.cx.cost.nest_multiplier(a.position.inst, true);
            let used: f64 = a
                .uses
                .iter()
                .map(|u| {
                    let data = module.inst(u.inst);
                    let bytes = if data.opcode == Opcode::DynamicUpdateSlice && u.operand == 0 {
                        data.operands
                            .get(1)
                            .map_or(0, |&update| module.shape(update).byte_size())
                            as f64
                    } else {
                        size
                    };
                    bytes * self.cx.cost.nest_multiplier(u.inst, true)
                })
                .sum();
            if copied > 0.0 && used / copied < threshold {
                trace!(allocation = %id, ratio = used / copied, "inefficient prefetch");
                offending.extend(a.uses.iter().cloned());
            }
        }
        offending
    }

    /// Records a copy in the resource ledger. The claim was checked before.
    pub(crate) fn claim_copy(&mut self, kind: CopyKind, windows: &[(i64, i64, f64)]) {
        let mut changes = FxHashMap::default();
        for &(start_after, done_before, amount) in windows {
            let (resource, tracker) = match kind {
                CopyKind::Prefetch => (&mut self.prefetch_resource, &mut self.prefetch_tracker),
                CopyKind::Eviction => (&mut self.eviction_resource, &mut self.eviction_tracker),
            };
            if !resource.try_consume(start_after, done_before, amount, &mut changes) {
                trace!(start_after, done_before, "copy resource overrun accepted");
            }
            let key = resource.add(start_after, done_before, amount);
            tracker.add(start_after, done_before);
            self.ledger.push((kind, key));
        }
    }
}
