//! redb table definitions for the FleetGrid state store.
//!
//! Clusters are keyed by numeric id; the name index maps the unique cluster
//! name back to that id. Scale requests use zero-padded composite keys so
//! that redb's lexicographic key order equals creation order within a
//! cluster.

use redb::TableDefinition;

/// Cluster rows keyed by `{cluster_id}` (JSON-serialized `Cluster`).
pub const CLUSTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("clusters");

/// Unique-name index: `{name}` → `{cluster_id}`.
pub const CLUSTER_NAMES: TableDefinition<&str, u64> = TableDefinition::new("cluster_names");

/// Scale request rows keyed by `{cluster_id:020}:{request_id:020}`.
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Monotonic id counters keyed by counter name (`clusters`, `requests`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Composite key for a scale request row.
pub fn request_key(cluster_id: u64, request_id: u64) -> String {
    format!("{cluster_id:020}:{request_id:020}")
}

/// Prefix matching every request row of one cluster.
pub fn request_prefix(cluster_id: u64) -> String {
    format!("{cluster_id:020}:")
}
