use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Non-fatal numerical condition raised while a calculation keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericalWarning {
    pub code: String,
    pub message: String,
}

impl NumericalWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let warning = Self {
            code: code.into(),
            message: message.into(),
        };
        tracing::warn!(code = %warning.code, "{}", warning.message);
        warning
    }
}

impl Display for NumericalWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WARNING: [{}] {}", self.code, self.message)
    }
}

pub const WARN_NORMALIZATION_NON_POSITIVE: &str = "NUMERIC.NORMALIZATION_NON_POSITIVE";
pub const WARN_CONVOLUTION_NON_FINITE: &str = "NUMERIC.CONVOLUTION_NON_FINITE";
pub const WARN_TRANSPORT_NOT_CONVERGED: &str = "NUMERIC.TRANSPORT_NOT_CONVERGED";
pub const WARN_MONTE_CARLO_EMPTY_TALLY: &str = "NUMERIC.MONTE_CARLO_EMPTY_TALLY";
