//! Registry — cluster lifecycle and scale request submission.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use fleet_state::{
    Cluster, ClusterConfig, ClusterRef, ClusterState, ScaleRequest, StateError, StateStore,
};

use crate::error::{RegistryError, RegistryResult};

/// Cluster names become DNS-ish machine name prefixes, so the alphabet is
/// restricted up front.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9-]+$").expect("valid regex"));

/// Service facade over the state store. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Create a cluster with defaulted config and the given service tags.
    ///
    /// The name is validated before any row is written; a malformed name
    /// is rejected with `InvalidName` and leaves the store untouched.
    pub fn create_cluster(
        &self,
        name: &str,
        services: &[String],
        extra: HashMap<String, String>,
    ) -> RegistryResult<Cluster> {
        if !NAME_PATTERN.is_match(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let config = ClusterConfig {
            services: services.to_vec(),
            extra,
            ..ClusterConfig::default()
        };

        let cluster = self.store.create_cluster(name, config).map_err(|e| match e {
            StateError::Conflict(_) => RegistryError::NameTaken(name.to_string()),
            other => RegistryError::State(other),
        })?;

        info!(id = cluster.id, name = %cluster.name, "cluster created");
        Ok(cluster)
    }

    /// Resolve a cluster reference (id or unique name).
    pub fn get_cluster(&self, cluster_ref: &ClusterRef) -> RegistryResult<Cluster> {
        self.store.resolve(cluster_ref).map_err(|e| match e {
            StateError::NotFound(_) => RegistryError::UnknownCluster(cluster_ref.to_string()),
            other => RegistryError::State(other),
        })
    }

    /// List active clusters matching a substring query, paginated.
    pub fn list_clusters(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> RegistryResult<Vec<Cluster>> {
        Ok(self.store.list_clusters(query, offset, limit)?)
    }

    /// Mark a cluster deleted. Its machines are not touched here; any
    /// still-pending requests will be failed by the reconciler.
    pub fn delete_cluster(&self, cluster_ref: &ClusterRef) -> RegistryResult<Cluster> {
        let cluster = self.get_cluster(cluster_ref)?;
        let cluster = self.store.mark_cluster_deleted(cluster.id)?;
        info!(id = cluster.id, name = %cluster.name, "cluster deleted");
        Ok(cluster)
    }

    // ── Scale requests ─────────────────────────────────────────────

    /// Submit a scaling intent: the cluster should converge to
    /// `target_ask` machines. Returns the pending request immediately;
    /// the engine picks it up asynchronously.
    pub fn submit_scale_request(
        &self,
        cluster_ref: &ClusterRef,
        target_ask: u32,
        hint_machine: Option<String>,
    ) -> RegistryResult<ScaleRequest> {
        let cluster = self.get_cluster(cluster_ref)?;
        if cluster.state != ClusterState::Active {
            return Err(RegistryError::ClusterInactive(cluster.name));
        }

        let request = self
            .store
            .append_request(cluster.id, target_ask, hint_machine)?;
        info!(
            request_id = request.id,
            cluster = %cluster.name,
            target_ask,
            "scale request submitted"
        );
        Ok(request)
    }

    /// Full request history for a cluster, creation order, newest last.
    pub fn list_requests(&self, cluster_ref: &ClusterRef) -> RegistryResult<Vec<ScaleRequest>> {
        let cluster = self.get_cluster(cluster_ref)?;
        Ok(self.store.list_requests(cluster.id)?)
    }
}
