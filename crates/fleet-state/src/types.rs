//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of clusters and their scale
//! requests. All types are serializable to/from JSON for storage in redb
//! tables. Machines are deliberately absent: machine state is owned by the
//! cloud provider and queried live, never persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster.
pub type ClusterId = u64;

/// Unique identifier for a scale request.
pub type RequestId = u64;

// ── Result codes ──────────────────────────────────────────────────

/// The request converged: observed count equals the target.
pub const RESULT_APPLIED: i64 = 0;

/// The pass ran but the observed count did not reach the target
/// (partial or total provisioning failure).
pub const RESULT_PARTIAL: i64 = 1;

/// The cluster was deleted before the request was processed.
pub const RESULT_CLUSTER_INACTIVE: i64 = 2;

// ── Config defaults ───────────────────────────────────────────────

pub const CLOUD_DEFAULT: &str = "hetzner";
pub const SERVER_IMAGE_DEFAULT: &str = "ubuntu-24.04";
pub const SERVER_LOCATION_DEFAULT: &str = "ash";
pub const SERVER_TYPE_DEFAULT: &str = "cpx11";

// ── Cluster ───────────────────────────────────────────────────────

/// A managed machine cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    /// Unique name, lowercase alphanumeric and hyphen only. Machine names
    /// derive from it (`{name}-{n}`).
    pub name: String,
    /// Operator-declared target machine count. Written only when a scale
    /// request is accepted.
    pub size_ask: u32,
    /// Last-observed machine count. Written only by the reconciliation
    /// engine after a convergence step.
    pub size_has: u32,
    pub state: ClusterState,
    pub config: ClusterConfig,
    /// Unix timestamp (seconds) when this cluster was created.
    pub created_at: u64,
}

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Active,
    Deleted,
}

/// Provisioning configuration for a cluster's machines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Cloud provider name, e.g. "hetzner".
    pub cloud: String,
    /// VM image, e.g. "ubuntu-24.04".
    pub server_image: String,
    /// Provider location/region, e.g. "ash".
    pub server_location: String,
    /// VM size class, e.g. "cpx11".
    pub server_type: String,
    /// Service tags deployed onto the cluster's machines.
    pub services: Vec<String>,
    /// Provider-specific extras not modeled as named fields.
    pub extra: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cloud: CLOUD_DEFAULT.to_string(),
            server_image: SERVER_IMAGE_DEFAULT.to_string(),
            server_location: SERVER_LOCATION_DEFAULT.to_string(),
            server_type: SERVER_TYPE_DEFAULT.to_string(),
            services: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl Cluster {
    /// True when any indexed field contains `query` (case-sensitive
    /// substring match over name and config fields). An empty query
    /// matches everything.
    pub fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        self.name.contains(query)
            || self.config.cloud.contains(query)
            || self.config.server_image.contains(query)
            || self.config.server_location.contains(query)
            || self.config.server_type.contains(query)
            || self.config.services.iter().any(|s| s.contains(query))
            || self
                .config
                .extra
                .iter()
                .any(|(k, v)| k.contains(query) || v.contains(query))
    }
}

// ── Scale requests ────────────────────────────────────────────────

/// A scaling intent for one cluster. Append-only: rows are never deleted,
/// and `result_code` is written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleRequest {
    pub id: RequestId,
    pub cluster_id: ClusterId,
    /// Absolute size the cluster should converge to, not a delta.
    pub target_ask: u32,
    /// Machine name preferred for removal on scale-down.
    pub hint_machine: Option<String>,
    /// `None` = pending; `Some(0)` = applied; `Some(nonzero)` = failed.
    pub result_code: Option<i64>,
    /// Unix timestamp (seconds); request ids are assigned in creation
    /// order, so id order equals `created_at` order.
    pub created_at: u64,
}

impl ScaleRequest {
    pub fn is_pending(&self) -> bool {
        self.result_code.is_none()
    }

    /// Composite table key, zero-padded for lexicographic ordering.
    pub fn table_key(&self) -> String {
        crate::tables::request_key(self.cluster_id, self.id)
    }
}

// ── Cluster references ────────────────────────────────────────────

/// A cluster reference supplied at the boundary: either the numeric id or
/// the unique name. Resolved once into a `Cluster` by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRef {
    ById(ClusterId),
    ByName(String),
}

impl ClusterRef {
    /// Parse an operator-supplied string: all-digits means an id,
    /// anything else is a name.
    pub fn parse(s: &str) -> Self {
        match s.parse::<u64>() {
            Ok(id) => ClusterRef::ById(id),
            Err(_) => ClusterRef::ByName(s.to_string()),
        }
    }
}

impl std::fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterRef::ById(id) => write!(f, "{id}"),
            ClusterRef::ByName(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_ref_parse() {
        assert_eq!(ClusterRef::parse("42"), ClusterRef::ById(42));
        assert_eq!(
            ClusterRef::parse("web"),
            ClusterRef::ByName("web".to_string())
        );
        // Mixed alphanumerics are names, not ids.
        assert_eq!(
            ClusterRef::parse("web-1"),
            ClusterRef::ByName("web-1".to_string())
        );
    }

    #[test]
    fn config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.cloud, "hetzner");
        assert_eq!(config.server_image, "ubuntu-24.04");
        assert_eq!(config.server_location, "ash");
        assert_eq!(config.server_type, "cpx11");
        assert!(config.services.is_empty());
    }

    #[test]
    fn query_matches_name_and_config() {
        let cluster = Cluster {
            id: 1,
            name: "web".to_string(),
            size_ask: 0,
            size_has: 0,
            state: ClusterState::Active,
            config: ClusterConfig {
                services: vec!["workq".to_string()],
                extra: HashMap::from([("datacenter".to_string(), "fsn1-dc14".to_string())]),
                ..ClusterConfig::default()
            },
            created_at: 1000,
        };

        assert!(cluster.matches_query(""));
        assert!(cluster.matches_query("web"));
        assert!(cluster.matches_query("hetzner"));
        assert!(cluster.matches_query("workq"));
        assert!(cluster.matches_query("ash"));
        // Extra bag entries match by key and by value.
        assert!(cluster.matches_query("datacenter"));
        assert!(cluster.matches_query("fsn1"));
        assert!(!cluster.matches_query("db"));
    }
}
