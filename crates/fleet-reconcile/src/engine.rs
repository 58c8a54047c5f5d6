//! Reconciler — drives clusters from "has" to "ask".
//!
//! One pass handles one scale request: query live machines for ground
//! truth, compute the delta, create or destroy machines, re-query, then
//! write the observed size and the request's result code in a single
//! store transaction. Pending requests for a cluster are processed
//! strictly in creation order, one at a time, under the cluster's lease.
//!
//! A pass that dies mid-flight (crash, shutdown) is self-correcting: the
//! request stays pending and the next pass re-queries `list_machines`
//! rather than trusting any stale in-memory delta.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_provision::{CloudProvider, RetryPolicy, with_retry};
use fleet_state::{
    Cluster, ClusterId, ClusterState, RESULT_APPLIED, RESULT_CLUSTER_INACTIVE, RESULT_PARTIAL,
    ScaleRequest, StateError, StateStore,
};

use crate::error::ReconcileResult;
use crate::lease::LeaseRegistry;
use crate::names;

/// SSH credential registered with the provider before machines are
/// created, so new machines come up reachable.
#[derive(Debug, Clone)]
pub struct SshKey {
    /// Provider-side key name.
    pub name: String,
    /// Public key material.
    pub public_key: String,
}

/// What a reconciliation attempt for one cluster amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// No pending requests.
    Idle,
    /// Another pass holds the cluster's lease; try again next tick.
    Deferred,
    /// Processed this many requests to completion.
    Completed { requests_processed: u32 },
}

/// The reconciliation engine. Shared across tasks via `Arc`.
pub struct Reconciler {
    store: StateStore,
    provider: Arc<dyn CloudProvider>,
    leases: LeaseRegistry,
    retry: RetryPolicy,
    ssh_key: Option<SshKey>,
}

impl Reconciler {
    pub fn new(store: StateStore, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            store,
            provider,
            leases: LeaseRegistry::new(),
            retry: RetryPolicy::default(),
            ssh_key: None,
        }
    }

    /// Override the per-call retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register this SSH key before each scale-up.
    pub fn with_ssh_key(mut self, ssh_key: SshKey) -> Self {
        self.ssh_key = Some(ssh_key);
        self
    }

    /// Reconcile one cluster: drain its pending requests in creation
    /// order under the cluster lease.
    ///
    /// Returns `Deferred` without touching anything when the lease is
    /// already held. A store or ground-truth listing error aborts the
    /// current pass and leaves its request pending.
    pub async fn reconcile_cluster(&self, cluster_id: ClusterId) -> ReconcileResult<PassOutcome> {
        let Some(_lease) = self.leases.try_acquire(cluster_id) else {
            debug!(cluster_id, "lease held, deferring reconciliation");
            return Ok(PassOutcome::Deferred);
        };

        let mut processed = 0u32;
        loop {
            let Some(request) = self.store.oldest_pending_request(cluster_id)? else {
                break;
            };
            // Re-read the cluster each pass; its state may have changed.
            let cluster = self
                .store
                .get_cluster(cluster_id)?
                .ok_or_else(|| StateError::NotFound(format!("cluster '{cluster_id}'")))?;

            if cluster.state == ClusterState::Deleted {
                warn!(
                    cluster = %cluster.name,
                    request_id = request.id,
                    "cluster inactive, failing request without provider calls"
                );
                self.store.finish_pass(
                    cluster_id,
                    request.id,
                    cluster.size_has,
                    RESULT_CLUSTER_INACTIVE,
                )?;
                processed += 1;
                continue;
            }

            self.run_pass(&cluster, &request).await?;
            processed += 1;
        }

        Ok(if processed == 0 {
            PassOutcome::Idle
        } else {
            PassOutcome::Completed {
                requests_processed: processed,
            }
        })
    }

    /// One reconciliation pass for one request.
    async fn run_pass(&self, cluster: &Cluster, request: &ScaleRequest) -> ReconcileResult<()> {
        // Ground truth, never a cached count.
        let machines = with_retry(&self.retry, "list_machines", || {
            self.provider.list_machines(cluster)
        })
        .await?;
        let mut known_names: Vec<String> = machines.iter().map(|m| m.name.clone()).collect();

        let delta = i64::from(request.target_ask) - known_names.len() as i64;
        debug!(
            cluster = %cluster.name,
            request_id = request.id,
            target = request.target_ask,
            current = known_names.len(),
            delta,
            "reconciliation pass started"
        );

        if delta > 0 {
            self.register_ssh_key(cluster).await;

            for _ in 0..delta {
                let name = names::next_machine_name(&cluster.name, &known_names);
                let created = with_retry(&self.retry, "create_machine", || {
                    self.provider.create_machine(cluster, &name)
                })
                .await;
                match created {
                    Ok(handle) => {
                        debug!(cluster = %cluster.name, machine = %handle.name, "machine created");
                        known_names.push(handle.name);
                    }
                    Err(e) => {
                        // A failed slot does not abort the pass; the name
                        // is still consumed so the next slot gets a fresh
                        // one instead of hammering a poisoned name.
                        warn!(
                            cluster = %cluster.name,
                            machine = %name,
                            error = %e,
                            "machine creation failed, continuing with remaining slots"
                        );
                        known_names.push(name);
                    }
                }
            }
        } else if delta < 0 {
            let victims = names::eviction_order(
                &cluster.name,
                &known_names,
                request.hint_machine.as_deref(),
            );
            for name in victims.iter().take(delta.unsigned_abs() as usize) {
                let destroyed = with_retry(&self.retry, "destroy_machine", || {
                    self.provider.destroy_machine(cluster, name)
                })
                .await;
                match destroyed {
                    Ok(()) => debug!(cluster = %cluster.name, machine = %name, "machine destroyed"),
                    Err(e) => warn!(
                        cluster = %cluster.name,
                        machine = %name,
                        error = %e,
                        "machine destruction failed, continuing with remaining slots"
                    ),
                }
            }
        } else {
            debug!(cluster = %cluster.name, request_id = request.id, "already converged, no provider calls");
        }

        // Re-query rather than assuming our actions took effect.
        let observed = with_retry(&self.retry, "list_machines", || {
            self.provider.list_machines(cluster)
        })
        .await?
        .len() as u32;

        let result_code = if observed == request.target_ask {
            RESULT_APPLIED
        } else {
            RESULT_PARTIAL
        };
        self.store
            .finish_pass(cluster.id, request.id, observed, result_code)?;

        info!(
            cluster = %cluster.name,
            request_id = request.id,
            target = request.target_ask,
            observed,
            result_code,
            "reconciliation pass finished"
        );
        Ok(())
    }

    /// Best-effort SSH key registration before a scale-up. Failure is
    /// logged and creation still attempted: the key may already exist
    /// provider-side.
    async fn register_ssh_key(&self, cluster: &Cluster) {
        let Some(key) = &self.ssh_key else { return };
        let registered = with_retry(&self.retry, "register_ssh_key", || {
            self.provider.register_ssh_key(&key.name, &key.public_key)
        })
        .await;
        if let Err(e) = registered {
            warn!(
                cluster = %cluster.name,
                key = %key.name,
                error = %e,
                "ssh key registration failed, attempting machine creation anyway"
            );
        }
    }

    /// Reconcile every cluster that has pending requests, in parallel
    /// across clusters. Clusters whose lease is held are skipped.
    pub async fn reconcile_pending(self: &Arc<Self>) {
        let cluster_ids = match self.store.clusters_with_pending_requests() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan for pending requests");
                return;
            }
        };

        let mut tasks = Vec::with_capacity(cluster_ids.len());
        for cluster_id in cluster_ids {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = engine.reconcile_cluster(cluster_id).await {
                    tracing::error!(
                        cluster_id,
                        error = %e,
                        "reconciliation failed, request stays pending"
                    );
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Run the reconciler loop until shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.reconcile_pending().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provision::{MockCloud, ProvisionError};
    use fleet_registry::Registry;
    use fleet_state::ClusterRef;

    struct Harness {
        registry: Registry,
        store: StateStore,
        cloud: Arc<MockCloud>,
        engine: Arc<Reconciler>,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let registry = Registry::new(store.clone());
        let cloud = Arc::new(MockCloud::new());
        let engine = Arc::new(
            Reconciler::new(store.clone(), cloud.clone() as Arc<dyn CloudProvider>)
                .with_retry_policy(RetryPolicy::immediate(3)),
        );
        Harness {
            registry,
            store,
            cloud,
            engine,
        }
    }

    impl Harness {
        fn create_cluster(&self, name: &str) -> Cluster {
            self.registry
                .create_cluster(name, &["workq".to_string()], Default::default())
                .unwrap()
        }

        fn submit(&self, name: &str, ask: u32, hint: Option<&str>) -> ScaleRequest {
            self.registry
                .submit_scale_request(&ClusterRef::parse(name), ask, hint.map(String::from))
                .unwrap()
        }

        fn cluster(&self, name: &str) -> Cluster {
            self.store.get_cluster_by_name(name).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn scale_up_creates_sequential_machines() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.submit("web", 3, None);

        let outcome = h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Completed {
                requests_processed: 1
            }
        );

        assert_eq!(h.cloud.machine_names("web"), vec!["web-1", "web-2", "web-3"]);
        assert_eq!(h.cluster("web").size_has, 3);

        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_APPLIED));
    }

    #[tokio::test]
    async fn converged_cluster_issues_no_machine_calls() {
        let h = harness();
        let cluster = h.create_cluster("web");
        for n in 1..=3 {
            h.cloud.seed_machine("web", &format!("web-{n}"));
        }
        h.submit("web", 3, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.create_call_count(), 0);
        assert_eq!(h.cloud.destroy_call_count(), 0);
        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_APPLIED));
        assert_eq!(h.cluster("web").size_has, 3);
    }

    #[tokio::test]
    async fn numbering_skips_gaps_left_by_deletions() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.cloud.seed_machine("web", "web-1");
        h.cloud.seed_machine("web", "web-3");
        h.submit("web", 3, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.machine_names("web"), vec!["web-1", "web-3", "web-4"]);
        assert_eq!(h.cluster("web").size_has, 3);
    }

    #[tokio::test]
    async fn partial_failure_reported_honestly() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.cloud
            .fail_create_with("web-2", ProvisionError::QuotaExceeded);
        h.submit("web", 3, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        // Two of three slots succeeded; size_has reflects reality.
        assert_eq!(h.cloud.machine_names("web"), vec!["web-1", "web-3"]);
        assert_eq!(h.cluster("web").size_has, 2);

        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_PARTIAL));
        // The ask stays what the operator declared.
        assert_eq!(h.cluster("web").size_ask, 3);
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.cloud.fail_next_creates_transient(1);
        h.submit("web", 1, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.machine_names("web"), vec!["web-1"]);
        // First attempt rate-limited, second succeeded.
        assert_eq!(h.cloud.create_call_count(), 2);
        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_APPLIED));
    }

    #[tokio::test]
    async fn scale_down_evicts_newest_first() {
        let h = harness();
        let cluster = h.create_cluster("web");
        for n in 1..=3 {
            h.cloud.seed_machine("web", &format!("web-{n}"));
        }
        h.submit("web", 1, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.machine_names("web"), vec!["web-1"]);
        assert_eq!(h.cluster("web").size_has, 1);
    }

    #[tokio::test]
    async fn scale_down_honors_hint() {
        let h = harness();
        let cluster = h.create_cluster("web");
        for n in 1..=3 {
            h.cloud.seed_machine("web", &format!("web-{n}"));
        }
        h.submit("web", 2, Some("web-1"));

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        // The hint overrides newest-first for the first victim.
        assert_eq!(h.cloud.machine_names("web"), vec!["web-2", "web-3"]);
    }

    #[tokio::test]
    async fn destroy_failure_reported_honestly() {
        let h = harness();
        let cluster = h.create_cluster("web");
        for n in 1..=3 {
            h.cloud.seed_machine("web", &format!("web-{n}"));
        }
        h.cloud
            .fail_destroy_with("web-3", ProvisionError::Api("deletion locked".to_string()));
        h.submit("web", 1, None);

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        // Newest-first eviction tried web-3 (stuck) then web-2 (gone);
        // size_has reflects what actually survived.
        assert_eq!(h.cloud.machine_names("web"), vec!["web-1", "web-3"]);
        assert_eq!(h.cluster("web").size_has, 2);

        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_PARTIAL));
        assert_eq!(h.cluster("web").size_ask, 1);
    }

    #[tokio::test]
    async fn stale_hint_falls_back_to_newest_first() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.cloud.seed_machine("web", "web-1");
        h.cloud.seed_machine("web", "web-2");
        h.submit("web", 1, Some("web-9"));

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.machine_names("web"), vec!["web-1"]);
    }

    #[tokio::test]
    async fn requests_apply_strictly_in_creation_order() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.submit("web", 3, None);
        h.submit("web", 1, Some("web-2"));

        let outcome = h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Completed {
                requests_processed: 2
            }
        );

        // First request built web-1..web-3; the second evicted the hinted
        // web-2 and then the newest remaining, web-3.
        assert_eq!(h.cloud.machine_names("web"), vec!["web-1"]);
        assert_eq!(h.cluster("web").size_has, 1);

        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].result_code, Some(RESULT_APPLIED));
        assert_eq!(requests[1].result_code, Some(RESULT_APPLIED));
    }

    #[tokio::test]
    async fn deleted_cluster_requests_fail_without_provider_calls() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.submit("web", 3, None);
        h.store.mark_cluster_deleted(cluster.id).unwrap();

        h.engine.reconcile_cluster(cluster.id).await.unwrap();

        assert_eq!(h.cloud.create_call_count(), 0);
        assert_eq!(h.cloud.list_call_count(), 0);
        let requests = h.store.list_requests(cluster.id).unwrap();
        assert_eq!(requests[0].result_code, Some(RESULT_CLUSTER_INACTIVE));
    }

    #[tokio::test]
    async fn held_lease_defers_reconciliation() {
        let h = harness();
        let cluster = h.create_cluster("web");
        h.submit("web", 1, None);

        let _held = h.engine.leases.try_acquire(cluster.id).unwrap();
        let outcome = h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(outcome, PassOutcome::Deferred);

        // Nothing happened while the lease was held.
        assert_eq!(h.cloud.list_call_count(), 0);
        assert!(h.store.oldest_pending_request(cluster.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn idle_when_no_pending_requests() {
        let h = harness();
        let cluster = h.create_cluster("web");

        let outcome = h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(outcome, PassOutcome::Idle);
        assert_eq!(h.cloud.list_call_count(), 0);
    }

    #[tokio::test]
    async fn ssh_key_registered_before_scale_up() {
        let store = StateStore::open_in_memory().unwrap();
        let registry = Registry::new(store.clone());
        let cloud = Arc::new(MockCloud::new());
        let engine = Reconciler::new(store.clone(), cloud.clone() as Arc<dyn CloudProvider>)
            .with_retry_policy(RetryPolicy::immediate(3))
            .with_ssh_key(SshKey {
                name: "fleet".to_string(),
                public_key: "ssh-ed25519 AAAA test".to_string(),
            });

        let cluster = registry.create_cluster("web", &[], Default::default()).unwrap();
        registry
            .submit_scale_request(&ClusterRef::ById(cluster.id), 2, None)
            .unwrap();

        engine.reconcile_cluster(cluster.id).await.unwrap();

        assert!(cloud.ssh_key_registered("fleet"));
        // Once per scale-up pass, not per slot.
        assert_eq!(cloud.ssh_key_call_count(), 1);
    }

    #[tokio::test]
    async fn reconcile_pending_covers_all_clusters() {
        let h = harness();
        let web = h.create_cluster("web");
        let db = h.create_cluster("db");
        h.submit("web", 2, None);
        h.submit("db", 1, None);

        h.engine.reconcile_pending().await;

        assert_eq!(h.cloud.machine_names("web").len(), 2);
        assert_eq!(h.cloud.machine_names("db").len(), 1);
        assert!(h.store.oldest_pending_request(web.id).unwrap().is_none());
        assert!(h.store.oldest_pending_request(db.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn end_to_end_scale_up_then_down() {
        let h = harness();
        let cluster = h.create_cluster("web");

        h.submit("web", 3, None);
        h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(h.cloud.machine_names("web"), vec!["web-1", "web-2", "web-3"]);
        assert_eq!(h.cluster("web").size_has, 3);

        h.submit("web", 1, Some("web-2"));
        h.engine.reconcile_cluster(cluster.id).await.unwrap();
        assert_eq!(h.cloud.machine_names("web"), vec!["web-1"]);
        assert_eq!(h.cluster("web").size_has, 1);

        let requests = h.store.list_requests(cluster.id).unwrap();
        assert!(requests.iter().all(|r| r.result_code == Some(RESULT_APPLIED)));
    }
}
