//! Provisioning error taxonomy.
//!
//! Transient errors (timeouts, rate limits, transport failures) are retried
//! with bounded backoff inside a reconciliation pass; permanent errors
//! (quota, invalid spec, API rejection) fail the slot immediately.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors returned by a cloud provider backend.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// The call did not complete within its bounded timeout.
    #[error("provider call timed out")]
    Timeout,

    /// The provider is rate-limiting us.
    #[error("provider rate limit exceeded")]
    RateLimited,

    /// Account quota exhausted; retrying will not help.
    #[error("provider quota exceeded")]
    QuotaExceeded,

    /// The machine spec (image, location, type) was rejected.
    #[error("invalid machine spec: {0}")]
    InvalidSpec(String),

    /// Network/transport-level failure below the API.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other API-level rejection.
    #[error("provider api error: {0}")]
    Api(String),
}

impl ProvisionError {
    /// Whether a bounded retry within the same pass is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionError::Timeout | ProvisionError::RateLimited | ProvisionError::Transport(_)
        )
    }
}
