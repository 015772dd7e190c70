//! Error kinds surfaced by the scaling core

use crate::quantity::QuantityError;
use thiserror::Error;

/// Failures that end an experiment
///
/// Deployment readiness delays are not errors; they are absorbed by the
/// backoff policy and only become an abort reason once it is exhausted.
#[derive(Debug, Clone, Error)]
pub enum ScalerError {
    /// The load generator could not be reached or returned an unusable result
    #[error("benchmark unavailable: {0}")]
    BenchmarkUnavailable(String),

    /// Reading or writing deployment state failed
    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    /// The deployment changed between read and write
    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(#[from] QuantityError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ScalerError {
    /// True for failures of the orchestration control channel
    pub fn is_fatal_api_failure(&self) -> bool {
        matches!(
            self,
            ScalerError::OrchestratorUnavailable(_) | ScalerError::Conflict(_)
        )
    }
}

pub type Result<T, E = ScalerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_failures_are_classified() {
        assert!(ScalerError::Conflict("stale".into()).is_fatal_api_failure());
        assert!(ScalerError::OrchestratorUnavailable("down".into()).is_fatal_api_failure());
        assert!(!ScalerError::BenchmarkUnavailable("down".into()).is_fatal_api_failure());
    }

    #[test]
    fn test_quantity_errors_convert() {
        let err: ScalerError = QuantityError::Empty.into();
        assert_eq!(err.to_string(), "invalid quantity: quantity is empty");
    }
}
