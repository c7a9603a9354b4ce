//! Risk scoring error types.

use std::time::Duration;

use bankcore_common::BankError;
use thiserror::Error;

/// Errors raised while talking to a risk scorer.
///
/// None of these reach engine callers: the gate replaces the verdict with
/// its local fallback.
#[derive(Debug, Error)]
pub enum RiskError {
    /// Scorer did not answer in time.
    #[error("Risk scorer timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Scorer could not be reached or crashed.
    #[error("Risk scorer transport error: {0}")]
    Transport(String),

    /// Scorer answered with something that is not a usable verdict.
    #[error("Malformed risk response: {0}")]
    Malformed(String),

    /// Scorer reported its own failure.
    #[error("Risk scorer reported failure: {0}")]
    Unsuccessful(String),
}

impl From<RiskError> for BankError {
    fn from(error: RiskError) -> Self {
        BankError::ExternalServiceDegraded(error.to_string())
    }
}

/// Result type for risk scoring.
pub type RiskResult<T> = Result<T, RiskError>;
