//! Reconciliation error types.
//!
//! A `State` error aborts the current pass and leaves the request pending
//! for the next scheduling opportunity. A `Provision` error only reaches
//! this level when a ground-truth listing fails after retries; individual
//! create/destroy failures are recorded per slot inside the pass instead.

use thiserror::Error;

use fleet_provision::ProvisionError;
use fleet_state::StateError;

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provision(#[from] ProvisionError),
}
