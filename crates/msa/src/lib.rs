//! Memory-space assignment for `memspace-ir` modules.
//!
//! Decides which values live in the small alternate memory, at which
//! offsets, and which asynchronous copies move them between the two tiers,
//! then patches the module with the copies.
pub mod algorithm;
pub mod allocation;
pub mod async_copy;
pub mod chunk;
pub mod copy_resource;
pub mod cost;
pub mod cross_program;
pub mod error;
pub mod filter;
pub mod finalize;
pub mod interval_tree;
pub mod live_range;
pub mod loop_opt;
pub mod options;
pub mod picker;
pub mod repack;
pub mod slicing;
pub mod stats;
pub mod trace;
pub mod verify;

use ir::{AliasAnalysis, CallGraph, Dataflow, Module};
use tracing::{debug, info, warn};

pub use algorithm::{AllocationOutcome, Analyses, MsaAlgorithm};
pub use allocation::{Allocation, AllocationId, AllocationKind, MemorySpace};
pub use chunk::Chunk;
pub use cost::{CostAnalysis, CostModel, ShapeCostAnalysis};
pub use error::{AllocationResult, MsaError};
pub use finalize::PresetAssignments;
pub use live_range::LiveRanges;
pub use loop_opt::LoopReport;
pub use options::Options;
pub use stats::Stats;
pub use trace::HeapTrace;
pub use verify::{VerificationReport, VerifierConfig};

/// Everything a run of the pass produced besides the patched module.
#[derive(Debug)]
pub struct MsaOutput {
    pub outcome: AllocationOutcome,
    pub preset: PresetAssignments,
    pub trace: HeapTrace,
    pub stats: Stats,
    /// Warnings of the invariant checks. Errors abort the pass instead.
    pub report: VerificationReport,
    pub loop_report: Option<LoopReport>,
}

/// Runs memory-space assignment over `module` and patches it with the
/// chosen copies and memory-space colours.
pub fn run(
    module: &mut Module,
    analysis: &dyn CostAnalysis,
    options: &Options,
) -> Result<MsaOutput, MsaError> {
    options.validate()?;
    let cfg = VerifierConfig::for_level(options.verification_level);

    let dataflow = Dataflow::analyze(module);
    let call_graph = CallGraph::new(module);
    let live = LiveRanges::new(module, &dataflow, &call_graph)?;

    let (outcome, loop_report, mut report) = {
        let module = &*module;
        let alias = AliasAnalysis::analyze(module, &dataflow);
        let cost = CostModel::new(
            analysis,
            module,
            &dataflow,
            &call_graph,
            options.benefit_scaling,
        );
        let cx = Analyses {
            module,
            dataflow: &dataflow,
            alias: &alias,
            call_graph: &call_graph,
            live: &live,
            cost: &cost,
        };

        let loop_report = if options.loop_optimizer.enabled {
            loop_opt::optimize(cx, options)
        } else {
            None
        };
        let preferred = loop_report
            .as_ref()
            .map(|r| r.preferred.clone())
            .unwrap_or_default();

        let outcome = MsaAlgorithm::new(cx, options)
            .with_preferred_starts(preferred)
            .run()?;

        let report = verify::verify_allocations(cx, options, &outcome, &cfg);
        if report.has_errors() {
            return Err(MsaError::InvariantViolation(report));
        }
        (outcome, loop_report, report)
    };

    let preset = finalize::finalize(module, &live, options, &outcome)?;
    verify::verify_colouring(module, options, &outcome, &cfg, &mut report);
    if report.has_errors() {
        return Err(MsaError::InvariantViolation(report));
    }
    for warning in report.warnings() {
        warn!("{warning}");
    }

    let trace = HeapTrace::from_allocations(&outcome.allocations);
    let stats = outcome.stats.clone();
    debug!(size = preset.size, peak = trace.peak(), "preset assignments");
    info!(
        prefetches = stats.prefetches,
        evictions = stats.evictions,
        sliced_prefetches = stats.sliced_prefetches,
        cross_program_prefetches = stats.cross_program_prefetches,
        bytes_prefetched = stats.bytes_prefetched,
        bytes_evicted = stats.bytes_evicted,
        buffers_in_default = stats.buffers_in_default,
        "memory-space assignment finished"
    );

    Ok(MsaOutput {
        outcome,
        preset,
        trace,
        stats,
        report,
        loop_report,
    })
}
