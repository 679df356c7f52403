#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationLevel {
    Fast,
    Standard,
    Full,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub level: VerificationLevel,
    pub max_diagnostics: usize,
    pub check_copies: bool,
    pub check_outstanding: bool,
    pub check_required: bool,
    pub check_uses: bool,
}

impl VerifierConfig {
    pub fn for_level(level: VerificationLevel) -> Self {
        match level {
            VerificationLevel::Fast => Self {
                level,
                max_diagnostics: 200,
                check_copies: false,
                check_outstanding: false,
                check_required: false,
                check_uses: false,
            },
            VerificationLevel::Standard => Self {
                level,
                max_diagnostics: 200,
                check_copies: true,
                check_outstanding: true,
                check_required: true,
                check_uses: false,
            },
            VerificationLevel::Full => Self {
                level,
                max_diagnostics: 500,
                check_copies: true,
                check_outstanding: true,
                check_required: true,
                check_uses: true,
            },
        }
    }

    pub fn should_check_copies(&self) -> bool {
        self.check_copies || matches!(self.level, VerificationLevel::Full)
    }

    pub fn should_check_outstanding(&self) -> bool {
        self.check_outstanding || matches!(self.level, VerificationLevel::Full)
    }

    pub fn should_check_required(&self) -> bool {
        self.check_required || matches!(self.level, VerificationLevel::Full)
    }

    pub fn should_check_uses(&self) -> bool {
        self.check_uses || matches!(self.level, VerificationLevel::Full)
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self::for_level(VerificationLevel::Standard)
    }
}
