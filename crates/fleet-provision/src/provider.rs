//! The `CloudProvider` trait and live machine types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_state::Cluster;

use crate::error::ProvisionResult;

/// A machine as reported by the cloud provider. Derived live on every
/// query; never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineHandle {
    /// Cloud-assigned id.
    pub id: String,
    /// Machine name in the form `{cluster-name}-{n}`.
    pub name: String,
    pub status: MachineStatus,
}

/// Provider-side lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Provisioning,
    Running,
    Terminating,
}

/// Boundary to the cloud provider.
///
/// Implementations must honor the idempotence contract documented at the
/// crate root: all four operations are safe to retry.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provision a machine named `name` using the cluster's config
    /// (image, location, type). "Name already exists" is success.
    async fn create_machine(&self, cluster: &Cluster, name: &str)
    -> ProvisionResult<MachineHandle>;

    /// Destroy the machine named `name`. Already gone is success.
    async fn destroy_machine(&self, cluster: &Cluster, name: &str) -> ProvisionResult<()>;

    /// Live query of the cluster's machines. Never cached.
    async fn list_machines(&self, cluster: &Cluster) -> ProvisionResult<Vec<MachineHandle>>;

    /// Register an SSH public key for use by newly created machines.
    /// Already registered is success.
    async fn register_ssh_key(&self, key_name: &str, public_key: &str) -> ProvisionResult<()>;
}
