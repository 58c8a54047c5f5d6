//! Admin channel between the CLI and a running daemon.
//!
//! The state database allows one open handle per process, so `fleetd
//! cluster ...` cannot open the store while `fleetd run` holds it.
//! Instead the daemon serves a Unix socket next to the database and the
//! CLI routes commands through it: one JSON request line per connection,
//! one JSON response line back. When no daemon is listening the CLI
//! falls back to opening the store directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_provision::{CloudProvider, MachineHandle};
use fleet_registry::Registry;
use fleet_state::{Cluster, ClusterRef, ScaleRequest};

/// Socket file name, created inside the daemon's data directory.
pub const SOCKET_FILE: &str = "fleetd.sock";

/// One admin operation, sent by the CLI as a single JSON line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    CreateCluster {
        name: String,
        services: Vec<String>,
    },
    ListClusters {
        query: String,
        offset: usize,
        limit: usize,
    },
    SubmitScale {
        cluster: String,
        target_ask: u32,
        hint_machine: Option<String>,
    },
    ListRequests {
        cluster: String,
    },
    ListMachines {
        cluster: String,
    },
    DeleteCluster {
        cluster: String,
    },
}

/// The daemon's answer. Failures travel in-band as `Error` so the CLI
/// can report them with a proper exit code.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Cluster { cluster: Cluster },
    Clusters { clusters: Vec<Cluster> },
    Request { request: ScaleRequest },
    Requests { requests: Vec<ScaleRequest> },
    Machines { machines: Vec<MachineHandle> },
    Error { message: String },
}

/// Serves admin requests against the daemon's own registry and provider.
/// Also used directly (without a socket) by the CLI's offline path.
pub struct AdminServer {
    registry: Registry,
    provider: Arc<dyn CloudProvider>,
}

/// Bind the admin socket, replacing a stale file left by an unclean exit.
pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = ?socket_path, "admin socket listening");
    Ok(listener)
}

impl AdminServer {
    pub fn new(registry: Registry, provider: Arc<dyn CloudProvider>) -> Self {
        Self { registry, provider }
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                warn!(error = %e, "admin connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "admin accept failed"),
                },
                _ = shutdown.changed() => {
                    info!("admin socket shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, stream: UnixStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        if let Some(line) = lines.next_line().await? {
            let response = match serde_json::from_str::<AdminRequest>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => AdminResponse::Error {
                    message: format!("malformed admin request: {e}"),
                },
            };
            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            write_half.write_all(&payload).await?;
        }
        Ok(())
    }

    /// Execute one admin operation.
    pub async fn dispatch(&self, request: AdminRequest) -> AdminResponse {
        match request {
            AdminRequest::CreateCluster { name, services } => respond(
                self.registry.create_cluster(&name, &services, HashMap::new()),
                |cluster| AdminResponse::Cluster { cluster },
            ),
            AdminRequest::ListClusters {
                query,
                offset,
                limit,
            } => respond(
                self.registry.list_clusters(&query, offset, limit),
                |clusters| AdminResponse::Clusters { clusters },
            ),
            AdminRequest::SubmitScale {
                cluster,
                target_ask,
                hint_machine,
            } => respond(
                self.registry.submit_scale_request(
                    &ClusterRef::parse(&cluster),
                    target_ask,
                    hint_machine,
                ),
                |request| AdminResponse::Request { request },
            ),
            AdminRequest::ListRequests { cluster } => respond(
                self.registry.list_requests(&ClusterRef::parse(&cluster)),
                |requests| AdminResponse::Requests { requests },
            ),
            AdminRequest::ListMachines { cluster } => {
                match self.registry.get_cluster(&ClusterRef::parse(&cluster)) {
                    Ok(cluster) => respond(self.provider.list_machines(&cluster).await, |machines| {
                        AdminResponse::Machines { machines }
                    }),
                    Err(e) => AdminResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            AdminRequest::DeleteCluster { cluster } => respond(
                self.registry.delete_cluster(&ClusterRef::parse(&cluster)),
                |cluster| AdminResponse::Cluster { cluster },
            ),
        }
    }
}

fn respond<T, E: std::fmt::Display>(
    result: Result<T, E>,
    wrap: impl FnOnce(T) -> AdminResponse,
) -> AdminResponse {
    match result {
        Ok(value) => wrap(value),
        Err(e) => AdminResponse::Error {
            message: e.to_string(),
        },
    }
}

/// Send one request to a running daemon. `None` means no daemon is
/// listening on the socket; the caller should fall back to opening the
/// store itself.
pub async fn try_send(
    socket_path: &Path,
    request: &AdminRequest,
) -> anyhow::Result<Option<AdminResponse>> {
    let stream = match UnixStream::connect(socket_path).await {
        Ok(stream) => stream,
        Err(_) => return Ok(None),
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;

    let mut lines = BufReader::new(read_half).lines();
    match lines.next_line().await? {
        Some(line) => Ok(Some(serde_json::from_str(&line)?)),
        None => anyhow::bail!("daemon closed the admin connection without a response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provision::MockCloud;
    use fleet_state::StateStore;

    fn server() -> (Arc<AdminServer>, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let registry = Registry::new(store.clone());
        let provider: Arc<dyn CloudProvider> = Arc::new(MockCloud::new());
        (Arc::new(AdminServer::new(registry, provider)), store)
    }

    #[tokio::test]
    async fn dispatch_create_then_scale() {
        let (server, store) = server();

        let response = server
            .dispatch(AdminRequest::CreateCluster {
                name: "web".to_string(),
                services: vec!["workq".to_string()],
            })
            .await;
        let AdminResponse::Cluster { cluster } = response else {
            panic!("expected cluster response");
        };
        assert_eq!(cluster.name, "web");

        let response = server
            .dispatch(AdminRequest::SubmitScale {
                cluster: "web".to_string(),
                target_ask: 3,
                hint_machine: None,
            })
            .await;
        let AdminResponse::Request { request } = response else {
            panic!("expected request response");
        };
        assert!(request.is_pending());
        assert!(store.oldest_pending_request(cluster.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn dispatch_reports_errors_in_band() {
        let (server, _store) = server();
        let response = server
            .dispatch(AdminRequest::SubmitScale {
                cluster: "ghost".to_string(),
                target_ask: 1,
                hint_machine: None,
            })
            .await;
        assert!(matches!(response, AdminResponse::Error { .. }));
    }

    #[tokio::test]
    async fn socket_submission_reaches_the_daemon_store() {
        // The store handle stays with the daemon; submission travels over
        // the socket and lands in the same database.
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_FILE);
        let (server, store) = server();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = bind(&socket).unwrap();
        let serve_handle = tokio::spawn(Arc::clone(&server).serve(listener, shutdown_rx));

        let response = try_send(
            &socket,
            &AdminRequest::CreateCluster {
                name: "web".to_string(),
                services: Vec::new(),
            },
        )
        .await
        .unwrap()
        .expect("daemon listening");
        let AdminResponse::Cluster { cluster } = response else {
            panic!("expected cluster response");
        };

        let response = try_send(
            &socket,
            &AdminRequest::SubmitScale {
                cluster: "web".to_string(),
                target_ask: 2,
                hint_machine: None,
            },
        )
        .await
        .unwrap()
        .expect("daemon listening");
        assert!(matches!(response, AdminResponse::Request { .. }));
        assert!(store.oldest_pending_request(cluster.id).unwrap().is_some());

        let _ = shutdown_tx.send(true);
        serve_handle.await.unwrap();
    }

    #[tokio::test]
    async fn try_send_without_daemon_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_FILE);
        let response = try_send(
            &socket,
            &AdminRequest::ListClusters {
                query: String::new(),
                offset: 0,
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert!(response.is_none());
    }
}
