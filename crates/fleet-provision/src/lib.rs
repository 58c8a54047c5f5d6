//! fleet-provision — the cloud provisioning boundary for FleetGrid.
//!
//! The reconciliation engine talks to the cloud through the
//! [`CloudProvider`] trait: create a machine, destroy a machine, list a
//! cluster's machines, register an SSH credential. Machine state is owned
//! by the provider and queried live; nothing here is cached.
//!
//! # Idempotence contract
//!
//! Every operation is safe to retry:
//! - `create_machine` treats "name already exists" as success and returns
//!   the existing handle;
//! - `destroy_machine` on an already-gone machine succeeds;
//! - `register_ssh_key` with an already-registered key succeeds.
//!
//! # Backends
//!
//! - [`MockCloud`] — in-memory provider with scripted failures and call
//!   counters, used by tests and `fleetd`'s mock mode.
//! - [`HetznerCloud`] — Hetzner Cloud v1 REST API over reqwest.

pub mod error;
pub mod hetzner;
pub mod mock;
pub mod provider;
pub mod retry;

pub use error::{ProvisionError, ProvisionResult};
pub use hetzner::HetznerCloud;
pub use mock::MockCloud;
pub use provider::{CloudProvider, MachineHandle, MachineStatus};
pub use retry::{RetryPolicy, with_retry};
