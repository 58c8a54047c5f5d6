//! In-memory mock provider for tests and local development.
//!
//! Machines live in a per-cluster map; failures can be scripted per
//! machine name or as a run of transient errors. Call counters let tests
//! assert how many provider calls a reconciliation pass issued.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::debug;

use fleet_state::Cluster;

use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{CloudProvider, MachineHandle, MachineStatus};

#[derive(Default)]
struct Inner {
    /// Cluster name → machines, in creation order.
    machines: HashMap<String, Vec<MachineHandle>>,
    /// Registered SSH keys: name → public key material.
    ssh_keys: HashMap<String, String>,
    next_id: u64,
    /// Creates for these machine names fail with the given error.
    fail_create: HashMap<String, ProvisionError>,
    /// Destroys for these machine names fail with the given error.
    fail_destroy: HashMap<String, ProvisionError>,
    /// The next N creates fail with `RateLimited` before the scripted
    /// per-name failures are consulted.
    transient_create_failures: u32,
}

/// Scriptable in-memory cloud provider.
#[derive(Default)]
pub struct MockCloud {
    inner: Mutex<Inner>,
    create_calls: AtomicU32,
    destroy_calls: AtomicU32,
    list_calls: AtomicU32,
    ssh_key_calls: AtomicU32,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Pre-seed a machine, as if provisioned in an earlier pass.
    pub fn seed_machine(&self, cluster_name: &str, machine_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let handle = MachineHandle {
            id: format!("mock-{}", inner.next_id),
            name: machine_name.to_string(),
            status: MachineStatus::Running,
        };
        inner
            .machines
            .entry(cluster_name.to_string())
            .or_default()
            .push(handle);
    }

    /// Fail every create for this machine name with the given error.
    pub fn fail_create_with(&self, machine_name: &str, error: ProvisionError) {
        self.inner
            .lock()
            .unwrap()
            .fail_create
            .insert(machine_name.to_string(), error);
    }

    /// Fail every destroy for this machine name with the given error.
    pub fn fail_destroy_with(&self, machine_name: &str, error: ProvisionError) {
        self.inner
            .lock()
            .unwrap()
            .fail_destroy
            .insert(machine_name.to_string(), error);
    }

    /// Fail the next `n` creates with `RateLimited` (exercises retry).
    pub fn fail_next_creates_transient(&self, n: u32) {
        self.inner.lock().unwrap().transient_create_failures = n;
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Machine names currently provisioned for a cluster.
    pub fn machine_names(&self, cluster_name: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .machines
            .get(cluster_name)
            .map(|machines| machines.iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ssh_key_registered(&self, key_name: &str) -> bool {
        self.inner.lock().unwrap().ssh_keys.contains_key(key_name)
    }

    pub fn create_call_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_call_count(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn list_call_count(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn ssh_key_call_count(&self) -> u32 {
        self.ssh_key_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn create_machine(
        &self,
        cluster: &Cluster,
        name: &str,
    ) -> ProvisionResult<MachineHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        if inner.transient_create_failures > 0 {
            inner.transient_create_failures -= 1;
            return Err(ProvisionError::RateLimited);
        }
        if let Some(error) = inner.fail_create.get(name) {
            return Err(error.clone());
        }

        // Idempotent: an existing name is a success, not a duplicate.
        if let Some(existing) = inner
            .machines
            .get(&cluster.name)
            .and_then(|machines| machines.iter().find(|m| m.name == name))
        {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let handle = MachineHandle {
            id: format!("mock-{}", inner.next_id),
            name: name.to_string(),
            status: MachineStatus::Running,
        };
        inner
            .machines
            .entry(cluster.name.clone())
            .or_default()
            .push(handle.clone());
        debug!(cluster = %cluster.name, machine = name, "mock machine created");
        Ok(handle)
    }

    async fn destroy_machine(&self, cluster: &Cluster, name: &str) -> ProvisionResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_destroy.get(name) {
            return Err(error.clone());
        }

        // Idempotent: destroying an already-gone machine succeeds.
        if let Some(machines) = inner.machines.get_mut(&cluster.name) {
            machines.retain(|m| m.name != name);
        }
        debug!(cluster = %cluster.name, machine = name, "mock machine destroyed");
        Ok(())
    }

    async fn list_machines(&self, cluster: &Cluster) -> ProvisionResult<Vec<MachineHandle>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner.machines.get(&cluster.name).cloned().unwrap_or_default())
    }

    async fn register_ssh_key(&self, key_name: &str, public_key: &str) -> ProvisionResult<()> {
        self.ssh_key_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        // Idempotent: re-registering is fine.
        inner
            .ssh_keys
            .insert(key_name.to_string(), public_key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{ClusterConfig, ClusterState};

    fn test_cluster(name: &str) -> Cluster {
        Cluster {
            id: 1,
            name: name.to_string(),
            size_ask: 0,
            size_has: 0,
            state: ClusterState::Active,
            config: ClusterConfig::default(),
            created_at: 1000,
        }
    }

    #[tokio::test]
    async fn create_list_destroy_roundtrip() {
        let cloud = MockCloud::new();
        let cluster = test_cluster("web");

        cloud.create_machine(&cluster, "web-1").await.unwrap();
        cloud.create_machine(&cluster, "web-2").await.unwrap();

        let machines = cloud.list_machines(&cluster).await.unwrap();
        assert_eq!(machines.len(), 2);

        cloud.destroy_machine(&cluster, "web-1").await.unwrap();
        assert_eq!(cloud.machine_names("web"), vec!["web-2"]);
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let cloud = MockCloud::new();
        let cluster = test_cluster("web");

        let first = cloud.create_machine(&cluster, "web-1").await.unwrap();
        let second = cloud.create_machine(&cluster, "web-1").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(cloud.machine_names("web").len(), 1);
        // Both invocations counted.
        assert_eq!(cloud.create_call_count(), 2);
    }

    #[tokio::test]
    async fn destroy_already_gone_succeeds() {
        let cloud = MockCloud::new();
        let cluster = test_cluster("web");

        cloud.destroy_machine(&cluster, "web-9").await.unwrap();
    }

    #[tokio::test]
    async fn scripted_failures_fire() {
        let cloud = MockCloud::new();
        let cluster = test_cluster("web");

        cloud.fail_create_with("web-1", ProvisionError::QuotaExceeded);
        let err = cloud.create_machine(&cluster, "web-1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::QuotaExceeded));
        assert!(cloud.machine_names("web").is_empty());

        cloud.fail_next_creates_transient(1);
        let err = cloud.create_machine(&cluster, "web-2").await.unwrap_err();
        assert!(matches!(err, ProvisionError::RateLimited));
        // The run is spent; the next create succeeds.
        cloud.create_machine(&cluster, "web-2").await.unwrap();
    }

    #[tokio::test]
    async fn clusters_are_isolated() {
        let cloud = MockCloud::new();
        let web = test_cluster("web");
        let db = test_cluster("db");

        cloud.create_machine(&web, "web-1").await.unwrap();
        cloud.create_machine(&db, "db-1").await.unwrap();

        assert_eq!(cloud.machine_names("web"), vec!["web-1"]);
        assert_eq!(cloud.machine_names("db"), vec!["db-1"]);
    }
}
