//! Independent re-check of an allocation outcome.
//!
//! Nothing here trusts the allocator's bookkeeping: occupied chunks are
//! replayed in time order into a fresh interval tree and copy windows are
//! recounted from the allocations themselves.
mod config;
mod diagnostic;
mod report;

use cranelift_entity::EntityRef;
use ir::Module;

pub use config::{VerificationLevel, VerifierConfig};
pub use diagnostic::{Diagnostic, DiagnosticCode, Location, Note, Severity};
pub use report::VerificationReport;

use crate::{
    algorithm::{AllocationOutcome, Analyses},
    allocation::{AllocationId, AllocationKind, CopyKind, MemorySpace},
    async_copy::AsyncCopyTracker,
    chunk::Chunk,
    interval_tree::IntervalTree,
    options::Options,
};

pub fn verify_allocations(
    cx: Analyses<'_>,
    options: &Options,
    outcome: &AllocationOutcome,
    cfg: &VerifierConfig,
) -> VerificationReport {
    let mut report = VerificationReport::default();
    let mut v = Verifier {
        cx,
        options,
        outcome,
        cfg,
        report: &mut report,
    };

    v.check_chunks();
    v.check_overlap();
    if cfg.should_check_copies() {
        v.check_copies();
    }
    if cfg.should_check_outstanding() {
        v.check_outstanding();
    }
    if cfg.should_check_required() {
        v.check_aliased_offsets();
        v.check_required();
    }
    if cfg.should_check_uses() {
        v.check_uses();
    }
    report
}

/// Checks that every value the outcome places in alternate memory without a
/// copy carries the alternate memory space in the patched module.
pub fn verify_colouring(
    module: &Module,
    options: &Options,
    outcome: &AllocationOutcome,
    cfg: &VerifierConfig,
    report: &mut VerificationReport,
) {
    for (id, a) in outcome.allocations.iter() {
        if !a.is_alternate() || a.kind != AllocationKind::Pinned {
            continue;
        }
        let Some(leaf) = module.shape(a.position.inst).leaf(&a.position.index) else {
            continue;
        };
        if leaf.memory_space != options.alternate_memory_space {
            report.push(
                Diagnostic::error(
                    DiagnosticCode::ColouringMismatch,
                    format!("{} is placed in alternate memory but not coloured", a.position),
                    Location::Allocation(id),
                )
                .with_note(format!("memory space is {}", leaf.memory_space)),
                cfg.max_diagnostics,
            );
        }
    }
}

struct Verifier<'a, 'r> {
    cx: Analyses<'a>,
    options: &'r Options,
    outcome: &'r AllocationOutcome,
    cfg: &'r VerifierConfig,
    report: &'r mut VerificationReport,
}

impl Verifier<'_, '_> {
    fn push(&mut self, diag: Diagnostic) {
        self.report.push(diag, self.cfg.max_diagnostics);
    }

    fn check_chunks(&mut self) {
        let max = self.options.max_size_bytes;
        let alignment = self.options.alignment_bytes.max(1);
        let chunks: Vec<(Location, Chunk)> = self
            .outcome
            .allocations
            .iter()
            .flat_map(|(id, a)| {
                a.occupied()
                    .into_iter()
                    .map(move |(_, _, chunk)| (Location::Allocation(id), chunk))
            })
            .chain(
                self.outcome
                    .scoped
                    .iter()
                    .map(|&(inst, chunk)| (Location::Inst(inst), chunk)),
            )
            .collect();

        for (loc, chunk) in chunks {
            if chunk.end() > max {
                self.push(
                    Diagnostic::error(
                        DiagnosticCode::CapacityExceeded,
                        format!("chunk {chunk} exceeds alternate memory"),
                        loc.clone(),
                    )
                    .with_note(format!("capacity is {max} bytes")),
                );
            }
            if chunk.offset % alignment != 0 {
                self.push(Diagnostic::error(
                    DiagnosticCode::MisalignedChunk,
                    format!("chunk {chunk} is not aligned to {alignment}"),
                    loc,
                ));
            }
        }
    }

    fn check_overlap(&mut self) {
        let mut rects: Vec<(i64, i64, Chunk, Option<AllocationId>)> = self
            .outcome
            .scoped
            .iter()
            .map(|&(inst, chunk)| {
                let t = self.cx.live.time(inst);
                (t, t, chunk, None)
            })
            .collect();
        for (id, a) in self.outcome.allocations.iter() {
            rects.extend(a.occupied().into_iter().map(|(s, e, c)| (s, e, c, Some(id))));
        }
        rects.sort_by_key(|&(s, e, c, id)| (s, e, c.offset, id));

        let aliased = &self.outcome.aliased;
        let mut tree: IntervalTree<Option<AllocationId>> = IntervalTree::default();
        let mut found = Vec::new();
        for (start, end, chunk, owner) in rects {
            for (s, e, other, other_owner) in tree.query(start, end) {
                let exempt = match (owner, other_owner) {
                    (Some(a), Some(b)) => a == b || aliased.same(a, b),
                    _ => false,
                };
                if !exempt && chunk.overlaps(&other) {
                    found.push((start, end, chunk, owner, s, e, other));
                }
            }
            tree.insert(start, end, chunk, owner);
        }

        for (start, end, chunk, owner, s, e, other) in found {
            let loc = owner.map_or(Location::Time(start), Location::Allocation);
            self.push(
                Diagnostic::error(
                    DiagnosticCode::ChunkOverlap,
                    format!("{chunk} over [{start}, {end}] overlaps {other} over [{s}, {e}]"),
                    loc,
                )
                .with_note(format!("first conflicting time is {}", start.max(s))),
            );
        }
    }

    fn check_copies(&mut self) {
        let module = self.cx.module;
        let live = self.cx.live;
        let allocations = &self.outcome.allocations;
        let mut found = Vec::new();
        for (id, a) in allocations.iter() {
            let Some(prev) = a.prev() else {
                continue;
            };
            let src = &allocations[prev];
            for (start_after, done_before) in a.copy_windows() {
                if start_after >= done_before {
                    found.push(Diagnostic::error(
                        DiagnosticCode::CopyNotCausal,
                        format!("copy starts after {start_after} but is done before {done_before}"),
                        Location::Allocation(id),
                    ));
                }
                let from_source = src.start <= start_after && start_after <= src.end;
                if !a.is_cross_program_prefetch() && !from_source {
                    found.push(
                        Diagnostic::error(
                            DiagnosticCode::CopyNotCausal,
                            format!("copy starts after {start_after} outside its source"),
                            Location::Allocation(id),
                        )
                        .with_note(format!("source {prev} lives over [{}, {}]", src.start, src.end)),
                    );
                }
            }
            if let Some((_, done_before)) = a.copy_window() {
                for u in &a.uses {
                    let t = live.use_time(module, u);
                    if t < done_before {
                        found.push(Diagnostic::error(
                            DiagnosticCode::CopyEndsAfterUse,
                            format!("use {u} at {t} precedes the copy done before {done_before}"),
                            Location::Allocation(id),
                        ));
                    }
                }
            }
            if let (AllocationKind::SlicedCopy { slices, .. }, Some(chunk)) = (&a.kind, a.chunk) {
                let mut pieces: Vec<Chunk> = slices.iter().map(|s| s.chunk).collect();
                pieces.sort();
                let mut at = chunk.offset;
                let mut contiguous = true;
                for piece in &pieces {
                    contiguous &= piece.offset == at;
                    at = piece.end();
                }
                if !contiguous || at != chunk.end() {
                    found.push(Diagnostic::error(
                        DiagnosticCode::SliceNotContiguous,
                        format!("slices of {chunk} do not tile it"),
                        Location::Allocation(id),
                    ));
                }
            }
        }
        for diag in found {
            self.push(diag);
        }
    }

    fn check_outstanding(&mut self) {
        let limits = [
            (
                CopyKind::Prefetch,
                self.options.max_outstanding_prefetches,
                DiagnosticCode::OutstandingPrefetchesExceeded,
            ),
            (
                CopyKind::Eviction,
                self.options.max_outstanding_evictions,
                DiagnosticCode::OutstandingEvictionsExceeded,
            ),
        ];
        for (kind, limit, code) in limits {
            let mut tracker = AsyncCopyTracker::new(limit);
            for (_, a) in self.outcome.allocations.iter() {
                if a.copy_kind() == Some(kind) {
                    for (s, d) in a.copy_windows() {
                        tracker.add(s, d);
                    }
                }
            }
            let max = tracker.max_outstanding();
            if limit >= 0 && max > limit {
                self.push(
                    Diagnostic::error(code, format!("{max} copies in flight"), Location::Module)
                        .with_note(format!("limit is {limit}")),
                );
            }

            if kind == CopyKind::Prefetch && self.options.enforce_prefetch_fifo_order {
                let mut earlier = AsyncCopyTracker::new(-1);
                for &(s, d) in tracker.copies() {
                    if earlier.violates_fifo(s, d) {
                        self.push(Diagnostic::error(
                            DiagnosticCode::FifoViolation,
                            format!("prefetch ({s}, {d}) finishes out of start order"),
                            Location::Time(s),
                        ));
                    }
                    earlier.add(s, d);
                }
            }
        }
    }

    fn check_aliased_offsets(&mut self) {
        let allocations = &self.outcome.allocations;
        let mut found = Vec::new();
        for group in self.outcome.aliased.groups() {
            let mut offsets = group
                .iter()
                .filter(|&&id| id.index() < allocations.len())
                .filter_map(|&id| allocations[id].chunk.map(|c| (id, c.offset)));
            let Some((first, offset)) = offsets.next() else {
                continue;
            };
            for (id, other) in offsets {
                if other != offset {
                    found.push(
                        Diagnostic::error(
                            DiagnosticCode::AliasedOffsetMismatch,
                            format!("{id} is at offset {other}, {first} at {offset}"),
                            Location::Allocation(id),
                        )
                        .with_note("aliased allocations share one offset"),
                    );
                }
            }
        }
        for diag in found {
            self.push(diag);
        }
    }

    fn check_required(&mut self) {
        let allocations = &self.outcome.allocations;
        let mut found = Vec::new();
        for r in self.outcome.required.iter() {
            let met = allocations.of_value(r.value).any(|(_, a)| {
                a.start <= r.time
                    && r.time <= a.end
                    && a.space == r.space
                    && r.offset.map_or(true, |o| a.chunk.is_some_and(|c| c.offset == o))
            });
            if !met {
                let space = match r.space {
                    MemorySpace::Default => "default",
                    MemorySpace::Alternate => "alternate",
                };
                found.push(Diagnostic::error(
                    DiagnosticCode::RequiredAssignmentViolated,
                    format!("{} must be in {space} memory at {}", r.value, r.time),
                    Location::Value(r.value),
                ));
            }
        }
        for diag in found {
            self.push(diag);
        }
    }

    fn check_uses(&mut self) {
        let module = self.cx.module;
        let live = self.cx.live;
        let allocations = &self.outcome.allocations;
        let mut found = Vec::new();
        for (value, data) in self.cx.dataflow.values() {
            if allocations.of_value(value).next().is_none() {
                continue;
            }
            for u in data.uses.iter().filter(|u| live.is_scheduled(u.inst)) {
                let t = live.use_time(module, u);
                let serving: Vec<_> = allocations
                    .of_value(value)
                    .filter(|(_, a)| a.uses.contains(u))
                    .collect();
                match serving.as_slice() {
                    [(_, a)] if a.start <= t && t <= a.end => {}
                    [(id, a)] => found.push(
                        Diagnostic::error(
                            DiagnosticCode::UseNotServed,
                            format!("use {u} at {t} is outside its allocation"),
                            Location::Allocation(*id),
                        )
                        .with_note(format!("allocation lives over [{}, {}]", a.start, a.end)),
                    ),
                    [] => found.push(Diagnostic::error(
                        DiagnosticCode::UseNotServed,
                        format!("use {u} of {value} is served by no allocation"),
                        Location::Inst(u.inst),
                    )),
                    many => found.push(Diagnostic::warning(
                        DiagnosticCode::UseNotServed,
                        format!("use {u} of {value} is served by {} allocations", many.len()),
                        Location::Inst(u.inst),
                    )),
                }
            }
        }
        for diag in found {
            self.push(diag);
        }
    }
}
