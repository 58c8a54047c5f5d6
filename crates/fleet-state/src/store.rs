//! StateStore — redb-backed persistence for FleetGrid.
//!
//! Holds the cluster registry and the scale request queue. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Invariants enforced here rather than in callers:
//! - cluster names are unique (secondary index, checked in the creation
//!   transaction);
//! - request ids are assigned from a durable counter, so id order equals
//!   creation order;
//! - `finish_pass` writes the request result and the cluster's observed
//!   size in one write transaction;
//! - a request's result code is written exactly once.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTER_NAMES).map_err(map_err!(Table))?;
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Create a cluster with a fresh id. Fails with `Conflict` if the name
    /// is already taken; nothing is written in that case.
    ///
    /// Name *syntax* is validated by the registry service before this call;
    /// the store only enforces uniqueness.
    pub fn create_cluster(&self, name: &str, config: ClusterConfig) -> StateResult<Cluster> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let cluster = {
            let mut names = txn.open_table(CLUSTER_NAMES).map_err(map_err!(Table))?;
            if names.get(name).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "cluster name '{name}' already exists"
                )));
            }

            let id = bump_counter(&txn, "clusters")?;
            let cluster = Cluster {
                id,
                name: name.to_string(),
                size_ask: 0,
                size_has: 0,
                state: ClusterState::Active,
                config,
                created_at: epoch_secs(),
            };

            let value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            clusters
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            names.insert(name, id).map_err(map_err!(Write))?;
            cluster
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = cluster.id, name = %cluster.name, "cluster created");
        Ok(cluster)
    }

    /// Get a cluster by id.
    pub fn get_cluster(&self, id: ClusterId) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let cluster: Cluster =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    /// Get a cluster by its unique name.
    pub fn get_cluster_by_name(&self, name: &str) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(CLUSTER_NAMES).map_err(map_err!(Table))?;
        let id = match names.get(name).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };
        drop(names);
        let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match clusters.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let cluster: Cluster =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    /// Resolve a `ClusterRef` into a cluster, erroring if it doesn't exist.
    pub fn resolve(&self, cluster_ref: &ClusterRef) -> StateResult<Cluster> {
        let found = match cluster_ref {
            ClusterRef::ById(id) => self.get_cluster(*id)?,
            ClusterRef::ByName(name) => self.get_cluster_by_name(name)?,
        };
        found.ok_or_else(|| StateError::NotFound(format!("cluster '{cluster_ref}'")))
    }

    /// Update a cluster row in place. The name is immutable after creation;
    /// the name index is not touched.
    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        let value = serde_json::to_vec(cluster).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            table
                .insert(cluster.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Mark a cluster deleted. The row is retained for audit; deleted
    /// clusters are excluded from listing and scaling.
    pub fn mark_cluster_deleted(&self, id: ClusterId) -> StateResult<Cluster> {
        let mut cluster = self
            .get_cluster(id)?
            .ok_or_else(|| StateError::NotFound(format!("cluster '{id}'")))?;
        cluster.state = ClusterState::Deleted;
        self.put_cluster(&cluster)?;
        debug!(id, name = %cluster.name, "cluster marked deleted");
        Ok(cluster)
    }

    /// List active clusters matching a substring query, with offset/limit
    /// pagination. Deleted clusters are excluded.
    pub fn list_clusters(
        &self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> StateResult<Vec<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        let mut skipped = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cluster: Cluster =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if cluster.state == ClusterState::Deleted || !cluster.matches_query(query) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            results.push(cluster);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // ── Scale requests ─────────────────────────────────────────────

    /// Append a pending scale request for a cluster and record the new ask
    /// on the cluster row, in one write transaction.
    ///
    /// The caller (registry service) validates that the cluster is active;
    /// the store only requires that it exists.
    pub fn append_request(
        &self,
        cluster_id: ClusterId,
        target_ask: u32,
        hint_machine: Option<String>,
    ) -> StateResult<ScaleRequest> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let request = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut cluster: Cluster = match clusters.get(cluster_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::NotFound(format!("cluster '{cluster_id}'")));
                }
            };

            let id = bump_counter(&txn, "requests")?;
            let request = ScaleRequest {
                id,
                cluster_id,
                target_ask,
                hint_machine,
                result_code: None,
                created_at: epoch_secs(),
            };

            let value = serde_json::to_vec(&request).map_err(map_err!(Serialize))?;
            let mut requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            requests
                .insert(request.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            // The ask is whatever the latest accepted request set it to.
            cluster.size_ask = target_ask;
            let cluster_value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
            clusters
                .insert(cluster_id, cluster_value.as_slice())
                .map_err(map_err!(Write))?;

            request
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            request_id = request.id,
            cluster_id, target_ask, "scale request appended"
        );
        Ok(request)
    }

    /// Get a single request by cluster and request id.
    pub fn get_request(
        &self,
        cluster_id: ClusterId,
        request_id: RequestId,
    ) -> StateResult<Option<ScaleRequest>> {
        let key = request_key(cluster_id, request_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let request: ScaleRequest =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// List all requests for a cluster in creation order (newest last).
    pub fn list_requests(&self, cluster_id: ClusterId) -> StateResult<Vec<ScaleRequest>> {
        let prefix = request_prefix(cluster_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let request: ScaleRequest =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(request);
            }
        }
        Ok(results)
    }

    /// The oldest request for a cluster whose result is not yet set.
    /// Defines the processing order for the reconciliation engine.
    pub fn oldest_pending_request(
        &self,
        cluster_id: ClusterId,
    ) -> StateResult<Option<ScaleRequest>> {
        let prefix = request_prefix(cluster_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let request: ScaleRequest =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if request.is_pending() {
                    return Ok(Some(request));
                }
            }
        }
        Ok(None)
    }

    /// Ids of all clusters that have at least one pending request.
    /// Scanned by the reconciler on every tick.
    pub fn clusters_with_pending_requests(&self) -> StateResult<Vec<ClusterId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let request: ScaleRequest =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // Keys are ordered by cluster id, so duplicates are contiguous.
            if request.is_pending() && ids.last() != Some(&request.cluster_id) {
                ids.push(request.cluster_id);
            }
        }
        Ok(ids)
    }

    /// Finish a reconciliation pass: write the freshly observed machine
    /// count onto the cluster and the result code onto the request, in one
    /// write transaction (atomic relative to each other).
    ///
    /// Fails with `Conflict` if the request already carries a result —
    /// results are written exactly once.
    pub fn finish_pass(
        &self,
        cluster_id: ClusterId,
        request_id: RequestId,
        observed: u32,
        result_code: i64,
    ) -> StateResult<()> {
        let key = request_key(cluster_id, request_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let mut request: ScaleRequest = match requests.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::NotFound(format!(
                        "request '{request_id}' for cluster '{cluster_id}'"
                    )));
                }
            };
            if !request.is_pending() {
                return Err(StateError::Conflict(format!(
                    "request '{request_id}' already has a result"
                )));
            }
            request.result_code = Some(result_code);
            let value = serde_json::to_vec(&request).map_err(map_err!(Serialize))?;
            requests
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut cluster: Cluster = match clusters.get(cluster_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::NotFound(format!("cluster '{cluster_id}'")));
                }
            };
            cluster.size_has = observed;
            let cluster_value = serde_json::to_vec(&cluster).map_err(map_err!(Serialize))?;
            clusters
                .insert(cluster_id, cluster_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id, request_id, observed, result_code, "pass finished");
        Ok(())
    }
}

/// Bump a named counter inside an open write transaction and return the
/// new value. Counters start at 1.
fn bump_counter(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let next = match counters.get(name).map_err(map_err!(Read))? {
        Some(guard) => guard.value() + 1,
        None => 1,
    };
    counters.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
