use std::fmt;

use ir::{ArrayShape, InstId, Module, Position, Use, ValueData};

use crate::{
    cost::BenefitScaling,
    error::MsaError,
    filter::FilterUpdatePreferredPrefetch,
    repack::Repacker,
    slicing::SliceProposal,
    verify::VerificationLevel,
};

pub type ValuePredicate = Box<dyn Fn(&Module, &ValueData) -> bool>;
pub type UsePredicate = Box<dyn Fn(&Module, &Use) -> bool>;
pub type PositionPredicate = Box<dyn Fn(&Module, &Position) -> bool>;
/// Bytes of scratch space an instruction needs in alternate memory while it
/// executes.
pub type ScopedMemoryFn = Box<dyn Fn(&Module, InstId) -> u64>;
pub type SizeFn = Box<dyn Fn(&ValueData) -> u64>;
/// Splits a prefetched array into at most `max_slices` slices.
pub type SliceProposalFn = Box<dyn Fn(&ArrayShape, u32) -> Option<Vec<SliceProposal>>>;
/// Adjusts the layout of a slice destination shape before it is emitted.
pub type SliceLayoutFn = Box<dyn Fn(&mut ArrayShape)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerKind {
    /// Every instruction counts as one unit of elapsed time.
    InstructionCount,
    /// Windows are measured with the cost analysis.
    CostAnalysis,
}

pub struct SlicedPrefetchOptions {
    /// Slicing is disabled while this is below 2.
    pub max_slices: u32,
    pub min_bytes: u64,
    /// Defaults to splitting the major dimension evenly.
    pub propose: Option<SliceProposalFn>,
    pub update_layout: Option<SliceLayoutFn>,
}

impl SlicedPrefetchOptions {
    pub fn is_enabled(&self) -> bool {
        self.max_slices >= 2
    }
}

impl Default for SlicedPrefetchOptions {
    fn default() -> Self {
        Self {
            max_slices: 0,
            min_bytes: 0,
            propose: None,
            update_layout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptimizerOptions {
    pub enabled: bool,
    /// Number of consecutive repetitions a window must show to be treated as
    /// a loop.
    pub min_iterations: usize,
    /// Scales the modelled copy time of the loop's prefetches. Left unset,
    /// copies take exactly the time given by the cost analysis.
    pub desired_copy_ratio: Option<f64>,
}

impl Default for LoopOptimizerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            min_iterations: 3,
            desired_copy_ratio: None,
        }
    }
}

/// Configuration of the pass.
pub struct Options {
    pub alternate_memory_space: i64,
    pub max_size_bytes: u64,
    pub alignment_bytes: u64,
    /// `-1` disables the bound.
    pub max_outstanding_prefetches: i64,
    pub max_outstanding_evictions: i64,

    pub picker: PickerKind,
    pub min_overlap_count: i64,
    pub max_overlap_count: i64,
    pub preferred_overlap_count: Option<i64>,
    pub min_overlap_to_async_ratio: f64,
    pub preferred_overlap_to_async_ratio: f64,
    pub max_overlap_to_mem_size_ratio: f64,
    pub max_decreasing_samples: usize,

    pub max_retries: u32,
    pub max_repacks: u32,
    /// Number of failed buffers after which a repack is attempted.
    pub repack_trigger: u32,
    pub enforce_prefetch_fifo_order: bool,

    pub enable_cross_program_prefetch: bool,
    pub max_cross_program_prefetches: usize,
    pub cross_program_prefetch_free_tail_ratio: f64,

    pub loop_optimizer: LoopOptimizerOptions,
    pub sliced_prefetch: SlicedPrefetchOptions,
    /// Zero disables the check.
    pub inefficient_use_to_copy_ratio: f64,

    pub is_allowed_in_alternate_mem: Option<ValuePredicate>,
    pub is_use_allowed_in_alternate_mem: Option<UsePredicate>,
    pub is_position_allowed_in_alternate_mem: Option<PositionPredicate>,
    pub reserved_scoped_memory: Option<ScopedMemoryFn>,
    pub size_fn: Option<SizeFn>,

    pub filter_update_preferred_prefetches: Vec<FilterUpdatePreferredPrefetch>,
    /// Buffer numbers to place first, in order.
    pub autotuning_config: Option<Vec<u32>>,
    pub repacker: Option<Box<dyn Repacker>>,
    pub benefit_scaling: BenefitScaling,
    pub verification_level: VerificationLevel,
    pub enable_while_parent_allocations: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alternate_memory_space: 1,
            max_size_bytes: 16 * 1024 * 1024,
            alignment_bytes: 1,
            max_outstanding_prefetches: -1,
            max_outstanding_evictions: -1,
            picker: PickerKind::InstructionCount,
            min_overlap_count: 1,
            max_overlap_count: 10,
            preferred_overlap_count: None,
            min_overlap_to_async_ratio: 1.0,
            preferred_overlap_to_async_ratio: 1.5,
            max_overlap_to_mem_size_ratio: 10.0,
            max_decreasing_samples: 8,
            max_retries: 1,
            max_repacks: 0,
            repack_trigger: 1,
            enforce_prefetch_fifo_order: false,
            enable_cross_program_prefetch: true,
            max_cross_program_prefetches: 1,
            cross_program_prefetch_free_tail_ratio: 0.1,
            loop_optimizer: LoopOptimizerOptions::default(),
            sliced_prefetch: SlicedPrefetchOptions::default(),
            inefficient_use_to_copy_ratio: 0.0,
            is_allowed_in_alternate_mem: None,
            is_use_allowed_in_alternate_mem: None,
            is_position_allowed_in_alternate_mem: None,
            reserved_scoped_memory: None,
            size_fn: None,
            filter_update_preferred_prefetches: Vec::new(),
            autotuning_config: None,
            repacker: None,
            benefit_scaling: BenefitScaling::Sqrt,
            verification_level: VerificationLevel::Standard,
            enable_while_parent_allocations: false,
        }
    }
}

impl Options {
    /// Rejects settings the allocator cannot honour.
    pub fn validate(&self) -> Result<(), MsaError> {
        if self.alignment_bytes == 0 {
            return Err(MsaError::invalid_option(
                "alignment_bytes",
                "must be at least 1",
            ));
        }
        if self.max_size_bytes != 0 && self.alignment_bytes > self.max_size_bytes {
            return Err(MsaError::invalid_option(
                "alignment_bytes",
                format!(
                    "{} exceeds the alternate memory size {}",
                    self.alignment_bytes, self.max_size_bytes
                ),
            ));
        }
        for (name, limit) in [
            ("max_outstanding_prefetches", self.max_outstanding_prefetches),
            ("max_outstanding_evictions", self.max_outstanding_evictions),
        ] {
            if limit < -1 {
                return Err(MsaError::invalid_option(name, "must be -1 or non-negative"));
            }
        }
        for (name, ratio) in [
            ("min_overlap_to_async_ratio", self.min_overlap_to_async_ratio),
            (
                "preferred_overlap_to_async_ratio",
                self.preferred_overlap_to_async_ratio,
            ),
            (
                "max_overlap_to_mem_size_ratio",
                self.max_overlap_to_mem_size_ratio,
            ),
        ] {
            if !(ratio > 0.0) {
                return Err(MsaError::invalid_option(name, "must be positive"));
            }
        }
        if self.min_overlap_count < 0 || self.min_overlap_count > self.max_overlap_count {
            return Err(MsaError::invalid_option(
                "min_overlap_count",
                format!(
                    "{} is not within 0..={}",
                    self.min_overlap_count, self.max_overlap_count
                ),
            ));
        }
        if self.max_decreasing_samples == 0 {
            return Err(MsaError::invalid_option(
                "max_decreasing_samples",
                "must be at least 1",
            ));
        }
        if self.sliced_prefetch.max_slices == 1 {
            return Err(MsaError::invalid_option(
                "sliced_prefetch.max_slices",
                "a sliced copy needs at least 2 slices",
            ));
        }
        if self.loop_optimizer.min_iterations < 2 {
            return Err(MsaError::invalid_option(
                "loop_optimizer.min_iterations",
                "must be at least 2",
            ));
        }
        if let Some(ratio) = self.loop_optimizer.desired_copy_ratio {
            if !(ratio > 0.0) {
                return Err(MsaError::invalid_option(
                    "loop_optimizer.desired_copy_ratio",
                    "must be positive",
                ));
            }
        }
        if self.inefficient_use_to_copy_ratio < 0.0 {
            return Err(MsaError::invalid_option(
                "inefficient_use_to_copy_ratio",
                "must not be negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.cross_program_prefetch_free_tail_ratio) {
            return Err(MsaError::invalid_option(
                "cross_program_prefetch_free_tail_ratio",
                "must be within 0..=1",
            ));
        }
        Ok(())
    }

    pub fn preferred_overlap_count(&self) -> i64 {
        self.preferred_overlap_count.unwrap_or(self.max_overlap_count)
    }

    pub(crate) fn value_allowed(&self, module: &Module, value: &ValueData) -> bool {
        self.is_allowed_in_alternate_mem
            .as_ref()
            .map_or(true, |f| f(module, value))
    }

    pub(crate) fn use_allowed(&self, module: &Module, u: &Use) -> bool {
        self.is_use_allowed_in_alternate_mem
            .as_ref()
            .map_or(true, |f| f(module, u))
    }

    pub(crate) fn position_allowed(&self, module: &Module, pos: &Position) -> bool {
        self.is_position_allowed_in_alternate_mem
            .as_ref()
            .map_or(true, |f| f(module, pos))
    }

    pub(crate) fn scoped_memory(&self, module: &Module, inst: InstId) -> u64 {
        self.reserved_scoped_memory
            .as_ref()
            .map_or(0, |f| f(module, inst))
    }

    pub(crate) fn size_of(&self, value: &ValueData) -> u64 {
        self.size_fn.as_ref().map_or_else(|| value.size(), |f| f(value))
    }

    pub(crate) fn align(&self, offset: u64) -> u64 {
        offset.div_ceil(self.alignment_bytes) * self.alignment_bytes
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |b: bool| if b { "set" } else { "unset" };
        f.debug_struct("Options")
            .field("alternate_memory_space", &self.alternate_memory_space)
            .field("max_size_bytes", &self.max_size_bytes)
            .field("alignment_bytes", &self.alignment_bytes)
            .field("max_outstanding_prefetches", &self.max_outstanding_prefetches)
            .field("max_outstanding_evictions", &self.max_outstanding_evictions)
            .field("picker", &self.picker)
            .field("min_overlap_count", &self.min_overlap_count)
            .field("max_overlap_count", &self.max_overlap_count)
            .field("preferred_overlap_count", &self.preferred_overlap_count)
            .field("min_overlap_to_async_ratio", &self.min_overlap_to_async_ratio)
            .field(
                "preferred_overlap_to_async_ratio",
                &self.preferred_overlap_to_async_ratio,
            )
            .field(
                "max_overlap_to_mem_size_ratio",
                &self.max_overlap_to_mem_size_ratio,
            )
            .field("max_decreasing_samples", &self.max_decreasing_samples)
            .field("max_retries", &self.max_retries)
            .field("max_repacks", &self.max_repacks)
            .field("repack_trigger", &self.repack_trigger)
            .field(
                "enforce_prefetch_fifo_order",
                &self.enforce_prefetch_fifo_order,
            )
            .field(
                "enable_cross_program_prefetch",
                &self.enable_cross_program_prefetch,
            )
            .field(
                "max_cross_program_prefetches",
                &self.max_cross_program_prefetches,
            )
            .field(
                "cross_program_prefetch_free_tail_ratio",
                &self.cross_program_prefetch_free_tail_ratio,
            )
            .field("loop_optimizer", &self.loop_optimizer)
            .field("max_slices", &self.sliced_prefetch.max_slices)
            .field("min_slice_bytes", &self.sliced_prefetch.min_bytes)
            .field(
                "inefficient_use_to_copy_ratio",
                &self.inefficient_use_to_copy_ratio,
            )
            .field(
                "is_allowed_in_alternate_mem",
                &set(self.is_allowed_in_alternate_mem.is_some()),
            )
            .field(
                "is_use_allowed_in_alternate_mem",
                &set(self.is_use_allowed_in_alternate_mem.is_some()),
            )
            .field(
                "is_position_allowed_in_alternate_mem",
                &set(self.is_position_allowed_in_alternate_mem.is_some()),
            )
            .field(
                "reserved_scoped_memory",
                &set(self.reserved_scoped_memory.is_some()),
            )
            .field("size_fn", &set(self.size_fn.is_some()))
            .field(
                "filter_update_preferred_prefetches",
                &self.filter_update_preferred_prefetches,
            )
            .field("autotuning_config", &self.autotuning_config)
            .field("repacker", &set(self.repacker.is_some()))
            .field("benefit_scaling", &self.benefit_scaling)
            .field("verification_level", &self.verification_level)
            .field(
                "enable_while_parent_allocations",
                &self.enable_while_parent_allocations,
            )
            .finish()
    }
}
