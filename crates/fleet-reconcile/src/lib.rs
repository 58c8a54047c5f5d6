//! fleet-reconcile — the reconciliation engine for FleetGrid.
//!
//! Consumes pending scale requests, compares the declared target ("ask")
//! against live machine state queried from the cloud provider ("has"),
//! and issues create/destroy calls to close the gap. Each request ends
//! with a definitive result code; partial convergence is recorded
//! honestly rather than rolled back.
//!
//! # Components
//!
//! - **`names`** — pure machine-name allocation and eviction ordering
//! - **`lease`** — per-cluster mutual exclusion for passes
//! - **`engine`** — the pass state machine and the background run loop

pub mod engine;
pub mod error;
pub mod lease;
pub mod names;

pub use engine::{PassOutcome, Reconciler, SshKey};
pub use error::{ReconcileError, ReconcileResult};
pub use lease::{Lease, LeaseRegistry};
pub use names::{eviction_order, next_machine_name};
