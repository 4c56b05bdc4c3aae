use thiserror::Error;

use crate::attribution::quotas::DenialReason;

/// Errors surfaced by the measurement engine.
///
/// Parse and validation failures are terminal for the registration that
/// produced them. Storage failures abort the surrounding transaction and are
/// expected to be retried by the caller.
#[derive(Debug, Error)]
pub enum MeasurementError {
    /// Malformed registration payload.
    #[error("Failed to parse registration: {0}")]
    Parse(String),

    /// Registration violates a data model invariant.
    #[error("Registration rejected: {0}")]
    Validation(String),

    /// Report-state or information-gain configuration is out of bounds.
    #[error("Invalid privacy configuration: {0}")]
    InvalidConfiguration(String),

    /// A registration was denied by a rate limit.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(DenialReason),

    /// The storage collaborator failed; the unit of work was rolled back.
    #[error("Storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<serde_json::Error> for MeasurementError {
    fn from(err: serde_json::Error) -> Self {
        MeasurementError::Parse(err.to_string())
    }
}

impl MeasurementError {
    /// Whether retrying the same unit of work could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeasurementError::Storage(_))
    }
}
