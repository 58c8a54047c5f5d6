//! Registry error types.
//!
//! Everything here is a validation failure surfaced immediately to the
//! caller — never retried — except `State`, which wraps an underlying
//! store failure.

use thiserror::Error;

use fleet_state::StateError;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced by the registry service.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid cluster name '{0}': lowercase letters, digits and hyphens only")]
    InvalidName(String),

    #[error("cluster name '{0}' already exists")]
    NameTaken(String),

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("cluster '{0}' is not active")]
    ClusterInactive(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
