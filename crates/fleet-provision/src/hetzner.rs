//! Hetzner Cloud provider — binds the `CloudProvider` trait to the
//! Hetzner Cloud v1 REST API.
//!
//! Servers created here carry a `fleetgrid-cluster` label so that
//! `list_machines` can query cluster membership server-side. The
//! idempotence contract is implemented on top of Hetzner's
//! `uniqueness_error` code: creating a name that already exists resolves
//! to the existing server, destroying a missing server succeeds.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_state::Cluster;

use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{CloudProvider, MachineHandle, MachineStatus};

pub const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Label attached to every server we create, holding the cluster name.
const CLUSTER_LABEL: &str = "fleetgrid-cluster";

/// Hetzner Cloud REST backend.
pub struct HetznerCloud {
    http: reqwest::Client,
    base_url: String,
    token: String,
    /// SSH key name attached to newly created servers, if any.
    ssh_key_name: Option<String>,
}

impl HetznerCloud {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            ssh_key_name: None,
        }
    }

    /// Override the API base URL (for tests against a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach this SSH key (by provider-side name) to created servers.
    pub fn with_ssh_key(mut self, key_name: impl Into<String>) -> Self {
        self.ssh_key_name = Some(key_name.into());
        self
    }

    async fn get_server_by_name(&self, name: &str) -> ProvisionResult<Option<ApiServer>> {
        let url = format!("{}/servers", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }
        let parsed: ListServersResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed.servers.into_iter().next())
    }
}

#[async_trait]
impl CloudProvider for HetznerCloud {
    async fn create_machine(
        &self,
        cluster: &Cluster,
        name: &str,
    ) -> ProvisionResult<MachineHandle> {
        let url = format!("{}/servers", self.base_url);
        let mut labels = HashMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), cluster.name.clone());

        let body = CreateServerRequest {
            name,
            server_type: &cluster.config.server_type,
            image: &cluster.config.server_image,
            location: &cluster.config.server_location,
            labels,
            ssh_keys: self.ssh_key_name.iter().cloned().collect(),
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();

        if status.is_success() {
            let parsed: CreateServerResponse = resp.json().await.map_err(transport_error)?;
            debug!(cluster = %cluster.name, machine = name, id = parsed.server.id, "server created");
            return Ok(parsed.server.into_handle());
        }

        let text = resp.text().await.unwrap_or_default();
        if is_uniqueness_error(&text) {
            // Retried create after a timeout: the earlier attempt went
            // through. Resolve to the existing server.
            debug!(cluster = %cluster.name, machine = name, "server already exists, reusing");
            return match self.get_server_by_name(name).await? {
                Some(server) => Ok(server.into_handle()),
                None => Err(ProvisionError::Api(format!(
                    "server '{name}' reported as duplicate but not found"
                ))),
            };
        }
        Err(classify_api_error(status, &text))
    }

    async fn destroy_machine(&self, cluster: &Cluster, name: &str) -> ProvisionResult<()> {
        let server = match self.get_server_by_name(name).await? {
            Some(server) => server,
            // Already gone is success.
            None => return Ok(()),
        };

        let url = format!("{}/servers/{}", self.base_url, server.id);
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(cluster = %cluster.name, machine = name, id = server.id, "server destroyed");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_api_error(status, &body))
    }

    async fn list_machines(&self, cluster: &Cluster) -> ProvisionResult<Vec<MachineHandle>> {
        let url = format!("{}/servers", self.base_url);
        let selector = format!("{CLUSTER_LABEL}={}", cluster.name);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("label_selector", selector.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }
        let parsed: ListServersResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed
            .servers
            .into_iter()
            .map(ApiServer::into_handle)
            .collect())
    }

    async fn register_ssh_key(&self, key_name: &str, public_key: &str) -> ProvisionResult<()> {
        let url = format!("{}/ssh_keys", self.base_url);
        let body = CreateSshKeyRequest {
            name: key_name,
            public_key,
        };
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            debug!(key = key_name, "ssh key registered");
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if is_uniqueness_error(&text) {
            // Already registered is success.
            return Ok(());
        }
        Err(classify_api_error(status, &text))
    }
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<String>,
}

#[derive(Serialize)]
struct CreateSshKeyRequest<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: ApiServer,
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ApiServer>,
}

#[derive(Debug, Deserialize)]
struct ApiServer {
    id: u64,
    name: String,
    status: String,
}

impl ApiServer {
    fn into_handle(self) -> MachineHandle {
        let status = machine_status(&self.status);
        MachineHandle {
            id: self.id.to_string(),
            name: self.name,
            status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

// ── Mapping helpers ───────────────────────────────────────────────

fn machine_status(api_status: &str) -> MachineStatus {
    match api_status {
        "running" => MachineStatus::Running,
        "deleting" | "stopping" | "off" => MachineStatus::Terminating,
        // initializing, starting, migrating, rebuilding, unknown
        _ => MachineStatus::Provisioning,
    }
}

fn transport_error(e: reqwest::Error) -> ProvisionError {
    if e.is_timeout() {
        ProvisionError::Timeout
    } else {
        ProvisionError::Transport(e.to_string())
    }
}

fn is_uniqueness_error(body: &str) -> bool {
    serde_json::from_str::<ApiErrorResponse>(body)
        .map(|resp| resp.error.code == "uniqueness_error")
        .unwrap_or(false)
}

fn classify_api_error(status: StatusCode, body: &str) -> ProvisionError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProvisionError::RateLimited;
    }
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(resp) => match resp.error.code.as_str() {
            "rate_limit_exceeded" => ProvisionError::RateLimited,
            "resource_limit_exceeded" | "resource_unavailable" => ProvisionError::QuotaExceeded,
            "invalid_input" | "server_type_not_available" => {
                ProvisionError::InvalidSpec(resp.error.message)
            }
            code => ProvisionError::Api(format!("{code}: {}", resp.error.message)),
        },
        Err(_) => ProvisionError::Api(format!("http {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_status_mapping() {
        assert_eq!(machine_status("running"), MachineStatus::Running);
        assert_eq!(machine_status("initializing"), MachineStatus::Provisioning);
        assert_eq!(machine_status("starting"), MachineStatus::Provisioning);
        assert_eq!(machine_status("deleting"), MachineStatus::Terminating);
        assert_eq!(machine_status("off"), MachineStatus::Terminating);
    }

    #[test]
    fn api_server_parses_into_handle() {
        let body = r#"{"servers":[{"id":42,"name":"web-1","status":"running","extra":"ignored"}]}"#;
        let parsed: ListServersResponse = serde_json::from_str(body).unwrap();
        let handle = parsed.servers.into_iter().next().unwrap().into_handle();

        assert_eq!(handle.id, "42");
        assert_eq!(handle.name, "web-1");
        assert_eq!(handle.status, MachineStatus::Running);
    }

    #[test]
    fn uniqueness_error_detected() {
        let body = r#"{"error":{"code":"uniqueness_error","message":"server name is already used"}}"#;
        assert!(is_uniqueness_error(body));
        assert!(!is_uniqueness_error("not json"));
        assert!(!is_uniqueness_error(
            r#"{"error":{"code":"invalid_input","message":"bad image"}}"#
        ));
    }

    #[test]
    fn api_errors_classified() {
        let quota = r#"{"error":{"code":"resource_limit_exceeded","message":"server limit"}}"#;
        assert!(matches!(
            classify_api_error(StatusCode::FORBIDDEN, quota),
            ProvisionError::QuotaExceeded
        ));

        let invalid = r#"{"error":{"code":"invalid_input","message":"image not found"}}"#;
        assert!(matches!(
            classify_api_error(StatusCode::UNPROCESSABLE_ENTITY, invalid),
            ProvisionError::InvalidSpec(_)
        ));

        assert!(matches!(
            classify_api_error(StatusCode::TOO_MANY_REQUESTS, ""),
            ProvisionError::RateLimited
        ));

        assert!(matches!(
            classify_api_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            ProvisionError::Api(_)
        ));
    }
}
