use std::fmt;

use super::diagnostic::Diagnostic;

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|diag| diag.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|diag| !diag.is_error())
    }

    pub(crate) fn push(&mut self, diagnostic: Diagnostic, max_diagnostics: usize) {
        if max_diagnostics == 0 || self.diagnostics.len() < max_diagnostics {
            self.diagnostics.push(diagnostic);
        }
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.diagnostics.is_empty() {
            return "verification succeeded".fmt(f);
        }

        for (index, diagnostic) in self.diagnostics.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{DiagnosticCode, Location};

    #[test]
    fn report_limits_and_formats() {
        let mut report = VerificationReport::default();
        assert!(report.is_ok());
        assert_eq!(report.to_string(), "verification succeeded");

        report.push(
            Diagnostic::warning(DiagnosticCode::UseNotServed, "unserved", Location::Time(3)),
            2,
        );
        assert!(report.is_ok());
        report.push(
            Diagnostic::error(DiagnosticCode::ChunkOverlap, "overlap", Location::Module)
                .with_note("offset 0"),
            2,
        );
        report.push(
            Diagnostic::error(DiagnosticCode::FifoViolation, "dropped", Location::Module),
            2,
        );

        assert!(report.has_errors());
        assert_eq!(report.errors().count(), 1);
        assert_eq!(report.warnings().count(), 1);
        insta::assert_snapshot!(report.to_string(), @r"
        warning [MS0400] unserved @ t3

        error [MS0002] overlap @ module
          note: offset 0
        ");
    }
}
