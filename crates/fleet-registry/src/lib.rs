//! fleet-registry — the service layer over the FleetGrid state store.
//!
//! Owns the validation that the store deliberately does not: cluster name
//! syntax, cluster-reference resolution, and the active-cluster check on
//! scale request submission. Submission appends a pending request and
//! returns immediately; reconciliation is decoupled and never runs
//! synchronously here.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::Registry;
