use std::fmt;

use ir::{InstId, ValueId};

use crate::allocation::AllocationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCode {
    CapacityExceeded,
    ChunkOverlap,
    MisalignedChunk,
    CopyNotCausal,
    CopyEndsAfterUse,
    SliceNotContiguous,
    OutstandingPrefetchesExceeded,
    OutstandingEvictionsExceeded,
    FifoViolation,
    AliasedOffsetMismatch,
    RequiredAssignmentViolated,
    UseNotServed,
    ColouringMismatch,
}

impl DiagnosticCode {
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::CapacityExceeded => 1,
            Self::ChunkOverlap => 2,
            Self::MisalignedChunk => 3,
            Self::CopyNotCausal => 100,
            Self::CopyEndsAfterUse => 101,
            Self::SliceNotContiguous => 102,
            Self::OutstandingPrefetchesExceeded => 200,
            Self::OutstandingEvictionsExceeded => 201,
            Self::FifoViolation => 202,
            Self::AliasedOffsetMismatch => 300,
            Self::RequiredAssignmentViolated => 301,
            Self::UseNotServed => 400,
            Self::ColouringMismatch => 401,
        }
    }

    pub fn as_str(self) -> String {
        format!("MS{:04}", self.as_u16())
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => "error".fmt(f),
            Self::Warning => "warning".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Module,
    Allocation(AllocationId),
    Value(ValueId),
    Inst(InstId),
    Time(i64),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module => "module".fmt(f),
            Self::Allocation(alloc) => write!(f, "{alloc}"),
            Self::Value(value) => write!(f, "{value}"),
            Self::Inst(inst) => write!(f, "{inst}"),
            Self::Time(t) => write!(f, "t{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,
    pub primary: Location,
    pub notes: Vec<Note>,
}

impl Diagnostic {
    pub fn new(
        code: DiagnosticCode,
        severity: Severity,
        message: impl Into<String>,
        primary: Location,
    ) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            primary,
            notes: Vec::new(),
        }
    }

    pub fn error(code: DiagnosticCode, message: impl Into<String>, primary: Location) -> Self {
        Self::new(code, Severity::Error, message, primary)
    }

    pub fn warning(code: DiagnosticCode, message: impl Into<String>, primary: Location) -> Self {
        Self::new(code, Severity::Warning, message, primary)
    }

    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.notes.push(Note {
            message: message.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} [{}] {} @ {}",
            self.severity, self.code, self.message, self.primary
        )?;

        for note in &self.notes {
            writeln!(f, "  note: {}", note.message)?;
        }

        Ok(())
    }
}
