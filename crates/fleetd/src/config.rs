//! fleetd configuration file (toml).
//!
//! Everything has a default so `fleetd run` works with no file at all:
//! mock provider, `/var/lib/fleetgrid` data dir, 15s reconcile interval.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use fleet_provision::RetryPolicy;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FleetdConfig {
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    /// Seconds between reconciler scans for pending requests.
    pub reconcile_interval_secs: u64,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    /// SSH credential registered before machines are created.
    pub ssh_key: Option<SshKeyConfig>,
}

impl Default for FleetdConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            reconcile_interval_secs: 15,
            provider: ProviderConfig::Mock,
            retry: RetryConfig::default(),
            ssh_key: None,
        }
    }
}

impl FleetdConfig {
    /// Load from a toml file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleetgrid.redb")
    }

    /// Admin socket served by a running daemon, next to the database.
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join(crate::admin::SOCKET_FILE)
    }
}

/// Which cloud backend to drive.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// In-memory provider; machines exist only for the process lifetime.
    Mock,
    Hetzner {
        token: String,
        /// Provider-side SSH key name attached to new servers.
        #[serde(default)]
        ssh_key_name: Option<String>,
    },
}

/// Retry parameters for provider calls.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            call_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

/// SSH key registered with the provider on scale-up.
#[derive(Debug, Deserialize)]
pub struct SshKeyConfig {
    pub name: String,
    /// Path to the public key file.
    pub public_key_path: PathBuf,
}
