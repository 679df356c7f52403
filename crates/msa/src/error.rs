use std::{fmt, ops};

use ir::{InstId, ValueId};
use thiserror::Error;

use crate::verify::VerificationReport;

/// Errors that abort the pass. Allocation failures of individual values are
/// never reported this way; they end in default memory instead.
#[derive(Debug, Error)]
pub enum MsaError {
    #[error("malformed schedule: {0}")]
    MalformedSchedule(String),

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("allocation invariants violated:\n{0}")]
    InvariantViolation(VerificationReport),

    #[error("required assignment of {value} at time {time} cannot be satisfied")]
    RequiredAssignmentUnsatisfiable { value: ValueId, time: i64 },

    #[error("cannot finalize {value} at {inst}: {reason}")]
    Finalization {
        value: ValueId,
        inst: InstId,
        reason: String,
    },
}

impl MsaError {
    pub(crate) fn invalid_option(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            reason: reason.into(),
        }
    }
}

/// Outcome of one allocation attempt. Failure reasons accumulate so the
/// caller can decide how to retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocationResult(u32);

impl AllocationResult {
    pub const SUCCESS: Self = Self(0);
    pub const FAIL_OUT_OF_MEMORY: Self = Self(1 << 0);
    pub const FAIL_OUT_OF_ASYNC_COPIES: Self = Self(1 << 1);
    pub const FAIL_VIOLATES_ASYNC_COPY_RESOURCE: Self = Self(1 << 2);
    pub const FAIL_LIVE_RANGE_TOO_LONG: Self = Self(1 << 3);
    pub const FAIL_LIVE_RANGE_TOO_SHORT: Self = Self(1 << 4);
    pub const FAIL_PREV_ALLOCATION_NOT_IN_ALTERNATE_MEM: Self = Self(1 << 5);
    pub const ALL_SLICES_HAVE_THE_SAME_START_TIME: Self = Self(1 << 6);
    pub const FAIL_REQUIRES_UNCOMMIT: Self = Self(1 << 7);
    pub const FAIL_VIOLATES_FIFO: Self = Self(1 << 8);
    pub const FAIL_CONFLICTING_PREFERRED_OFFSETS: Self = Self(1 << 9);

    const NAMES: [(Self, &'static str); 10] = [
        (Self::FAIL_OUT_OF_MEMORY, "out-of-memory"),
        (Self::FAIL_OUT_OF_ASYNC_COPIES, "out-of-async-copies"),
        (
            Self::FAIL_VIOLATES_ASYNC_COPY_RESOURCE,
            "violates-async-copy-resource",
        ),
        (Self::FAIL_LIVE_RANGE_TOO_LONG, "live-range-too-long"),
        (Self::FAIL_LIVE_RANGE_TOO_SHORT, "live-range-too-short"),
        (
            Self::FAIL_PREV_ALLOCATION_NOT_IN_ALTERNATE_MEM,
            "prev-allocation-not-in-alternate-mem",
        ),
        (
            Self::ALL_SLICES_HAVE_THE_SAME_START_TIME,
            "all-slices-have-the-same-start-time",
        ),
        (Self::FAIL_REQUIRES_UNCOMMIT, "requires-uncommit"),
        (Self::FAIL_VIOLATES_FIFO, "violates-fifo"),
        (
            Self::FAIL_CONFLICTING_PREFERRED_OFFSETS,
            "conflicting-preferred-offsets",
        ),
    ];

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Failures that can only be resolved by rolling back every pending
    /// allocation of the buffer.
    pub fn requires_uncommit(self) -> bool {
        self.contains(Self::FAIL_REQUIRES_UNCOMMIT)
    }
}

impl ops::BitOr for AllocationResult {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for AllocationResult {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AllocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return f.write_str("success");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_flags_accumulate() {
        let mut result = AllocationResult::SUCCESS;
        assert!(result.is_success());
        result |= AllocationResult::FAIL_OUT_OF_MEMORY;
        result |= AllocationResult::FAIL_VIOLATES_FIFO;
        assert!(result.is_failure());
        assert!(result.contains(AllocationResult::FAIL_OUT_OF_MEMORY));
        assert!(!result.contains(AllocationResult::FAIL_LIVE_RANGE_TOO_LONG));
        assert!(!result.requires_uncommit());
        assert_eq!(result.to_string(), "out-of-memory|violates-fifo");
    }
}
