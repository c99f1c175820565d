//! Error type shared by the whole crate.
//!
//! Numerical rejections inside the likelihood (non-positive-definite
//! covariances, prior violations, singular overlaps) are *not* errors: they are
//! reported as `f64::NEG_INFINITY` and absorbed by the sampler/optimizer. Only
//! structural problems travel through `FitError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FitError {
    /// Invalid combination of settings, detected before any fitting starts.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Malformed input shapes or non-finite input values.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// No walker/start in the initial ensemble (and its retries) produced a
    /// finite log-probability.
    #[error("Infeasible initialization: no finite log-probability after {attempts} attempt(s) with {n_positions} position(s)")]
    InfeasibleInitialization { attempts: usize, n_positions: usize },

    /// A single-component fit could not produce any usable sample.
    #[error("Component fit failed: {0}")]
    FitFailed(String),

    /// A star has −∞ log-overlap against every component and the background.
    #[error("Degenerate membership row for star {star}: every column has zero overlap")]
    DegenerateMembership { star: usize },

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FitError {
    pub fn config(message: impl Into<String>) -> Self {
        FitError::Configuration(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        FitError::InvalidData(message.into())
    }

    /// Process exit code a driver should use when surfacing this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::Configuration(_) | FitError::Io(_) | FitError::Json(_) => 2,
            FitError::InvalidData(_) => 3,
            FitError::InfeasibleInitialization { .. }
            | FitError::FitFailed(_)
            | FitError::DegenerateMembership { .. }
            | FitError::Optimizer(_) => 4,
        }
    }

    /// Whether the EM controller may drop the failing candidate and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FitError::InfeasibleInitialization { .. }
                | FitError::FitFailed(_)
                | FitError::DegenerateMembership { .. }
                | FitError::Optimizer(_)
        )
    }
}

// argmin reports failures through its own (anyhow-style) error type, which does
// not implement `std::error::Error`, so `#[from]` cannot be used here.
impl From<argmin::core::Error> for FitError {
    fn from(value: argmin::core::Error) -> Self {
        FitError::Optimizer(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(FitError::config("bad").exit_code(), 2);
        assert_eq!(FitError::data("bad").exit_code(), 3);
        assert_eq!(FitError::FitFailed("x".into()).exit_code(), 4);
        assert_eq!(FitError::DegenerateMembership { star: 3 }.exit_code(), 4);
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(!FitError::config("bad").is_recoverable());
        assert!(!FitError::data("bad").is_recoverable());
        assert!(FitError::FitFailed("x".into()).is_recoverable());
    }
}
