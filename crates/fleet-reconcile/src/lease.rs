//! Per-cluster reconciliation leases.
//!
//! At most one reconciliation pass may run per cluster at any time;
//! distinct clusters proceed in parallel. A conflicting acquisition is
//! not an error — the caller defers to the next scheduling tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use fleet_state::ClusterId;

/// Exclusive right to reconcile one cluster. Released on drop.
pub struct Lease {
    _guard: OwnedMutexGuard<()>,
}

/// Registry of per-cluster locks. Locks are created lazily on first use
/// and kept for the life of the registry.
#[derive(Default)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<ClusterId, Arc<AsyncMutex<()>>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the cluster's lease without waiting. `None` means a pass
    /// is already running for this cluster.
    pub fn try_acquire(&self, cluster_id: ClusterId) -> Option<Lease> {
        let lock = {
            let mut leases = self.leases.lock().unwrap();
            leases
                .entry(cluster_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok().map(|guard| Lease { _guard: guard })
    }
}
