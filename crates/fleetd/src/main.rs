//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles the subsystems:
//! - State store (redb): cluster registry + scale request queue
//! - Cloud provider (mock or Hetzner)
//! - Reconciliation engine + background loop
//!
//! plus an operator CLI for the boundaries the daemon consumes:
//! cluster creation, scale request submission, and state inspection.
//! While the daemon runs it holds the only store handle, so the CLI
//! talks to it over an admin socket; with no daemon running the CLI
//! opens the store directly.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleetd.toml
//! fleetd cluster create web --services workq
//! fleetd cluster scale web --ask 3
//! fleetd cluster requests web
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleet_provision::{CloudProvider, HetznerCloud, MockCloud};
use fleet_reconcile::{Reconciler, SshKey};
use fleet_registry::Registry;
use fleet_state::StateStore;

use crate::admin::{AdminRequest, AdminResponse, AdminServer};
use crate::config::{FleetdConfig, ProviderConfig};

mod admin;
mod config;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    /// Path to the fleetd.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation daemon.
    Run,

    /// Inspect and manage clusters.
    #[command(subcommand)]
    Cluster(ClusterCommand),
}

#[derive(Subcommand)]
enum ClusterCommand {
    /// Create a cluster.
    Create {
        /// Cluster name (lowercase letters, digits, hyphens).
        name: String,
        /// Service tags, comma separated.
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,
    },
    /// List clusters.
    List {
        /// Substring matched against name and config fields.
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Submit a scale request.
    Scale {
        /// Cluster id or name.
        cluster: String,
        /// Target machine count.
        #[arg(long)]
        ask: u32,
        /// Machine name preferred for removal on scale-down.
        #[arg(long)]
        machine: Option<String>,
        /// Reconcile immediately instead of waiting for the daemon.
        #[arg(long)]
        now: bool,
    },
    /// Show a cluster's scale request history.
    Requests {
        /// Cluster id or name.
        cluster: String,
    },
    /// List a cluster's live machines (queried from the provider).
    Machines {
        /// Cluster id or name.
        cluster: String,
    },
    /// Mark a cluster deleted (kept for audit, excluded from scaling).
    Delete {
        /// Cluster id or name.
        cluster: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = FleetdConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run_daemon(config).await,
        Command::Cluster(cmd) => run_cluster_command(config, cmd).await,
    }
}

async fn run_daemon(config: FleetdConfig) -> anyhow::Result<()> {
    info!("fleetd starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let store = StateStore::open(&config.db_path())?;
    info!(path = ?config.db_path(), "state store opened");

    let provider = build_provider(&config)?;
    let mut engine = Reconciler::new(store.clone(), Arc::clone(&provider))
        .with_retry_policy(config.retry.to_policy());
    if let Some(ssh_key) = load_ssh_key(&config)? {
        engine = engine.with_ssh_key(ssh_key);
    }
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.reconcile_interval_secs);
    let loop_handle = tokio::spawn(Arc::clone(&engine).run(interval, shutdown_rx));

    // The admin socket shares this process's store handle and provider,
    // so CLI commands keep working while the daemon holds the database.
    let admin_server = Arc::new(AdminServer::new(Registry::new(store.clone()), provider));
    let listener = admin::bind(&config.socket_path())?;
    let admin_handle =
        tokio::spawn(Arc::clone(&admin_server).serve(listener, shutdown_tx.subscribe()));

    info!("fleetd running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // In-flight provider calls stay in effect; the next pass re-queries
    // ground truth, so stopping here is safe.
    let _ = shutdown_tx.send(true);
    loop_handle.await?;
    admin_handle.await?;
    let _ = std::fs::remove_file(config.socket_path());

    info!("fleetd stopped");
    Ok(())
}

async fn run_cluster_command(config: FleetdConfig, cmd: ClusterCommand) -> anyhow::Result<()> {
    let request = admin_request_for(&cmd);

    // A running daemon holds the only store handle; route through its
    // admin socket. With no daemon listening, open the store ourselves.
    if let Some(response) = admin::try_send(&config.socket_path(), &request).await? {
        print_response(&cmd, &response)?;
        if matches!(cmd, ClusterCommand::Scale { now: true, .. }) {
            println!("daemon is running; the request reconciles on its next tick");
        }
        return Ok(());
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let store = StateStore::open(&config.db_path())?;
    let provider = build_provider(&config)?;
    let server = AdminServer::new(Registry::new(store.clone()), Arc::clone(&provider));

    let response = server.dispatch(request).await;
    print_response(&cmd, &response)?;

    if let (ClusterCommand::Scale { now: true, .. }, AdminResponse::Request { request }) =
        (&cmd, &response)
    {
        let mut engine =
            Reconciler::new(store, provider).with_retry_policy(config.retry.to_policy());
        if let Some(ssh_key) = load_ssh_key(&config)? {
            engine = engine.with_ssh_key(ssh_key);
        }
        let outcome = engine.reconcile_cluster(request.cluster_id).await?;
        println!("reconciliation: {outcome:?}");
    }
    Ok(())
}

fn admin_request_for(cmd: &ClusterCommand) -> AdminRequest {
    match cmd {
        ClusterCommand::Create { name, services } => AdminRequest::CreateCluster {
            name: name.clone(),
            services: services.clone(),
        },
        ClusterCommand::List {
            query,
            offset,
            limit,
        } => AdminRequest::ListClusters {
            query: query.clone(),
            offset: *offset,
            limit: *limit,
        },
        ClusterCommand::Scale {
            cluster,
            ask,
            machine,
            ..
        } => AdminRequest::SubmitScale {
            cluster: cluster.clone(),
            target_ask: *ask,
            hint_machine: machine.clone(),
        },
        ClusterCommand::Requests { cluster } => AdminRequest::ListRequests {
            cluster: cluster.clone(),
        },
        ClusterCommand::Machines { cluster } => AdminRequest::ListMachines {
            cluster: cluster.clone(),
        },
        ClusterCommand::Delete { cluster } => AdminRequest::DeleteCluster {
            cluster: cluster.clone(),
        },
    }
}

fn print_response(cmd: &ClusterCommand, response: &AdminResponse) -> anyhow::Result<()> {
    match (cmd, response) {
        (_, AdminResponse::Error { message }) => anyhow::bail!("{message}"),
        (ClusterCommand::Create { .. }, AdminResponse::Cluster { cluster }) => {
            println!("cluster '{}' created (id {})", cluster.name, cluster.id);
        }
        (ClusterCommand::Delete { .. }, AdminResponse::Cluster { cluster }) => {
            println!("cluster '{}' deleted", cluster.name);
        }
        (ClusterCommand::List { .. }, AdminResponse::Clusters { clusters }) => {
            println!(
                "{:<6} {:<20} {:>4} {:>4}  {:<10} {:<12} {}",
                "ID", "NAME", "ASK", "HAS", "CLOUD", "TYPE", "SERVICES"
            );
            for cluster in clusters {
                println!(
                    "{:<6} {:<20} {:>4} {:>4}  {:<10} {:<12} {}",
                    cluster.id,
                    cluster.name,
                    cluster.size_ask,
                    cluster.size_has,
                    cluster.config.cloud,
                    cluster.config.server_type,
                    cluster.config.services.join(",")
                );
            }
        }
        (ClusterCommand::Scale { cluster, ask, .. }, AdminResponse::Request { request }) => {
            println!(
                "scale request {} submitted: cluster '{}' -> {} machines",
                request.id, cluster, ask
            );
        }
        (ClusterCommand::Requests { .. }, AdminResponse::Requests { requests }) => {
            println!("{:<6} {:>4}  {:<12} {:<10}", "ID", "ASK", "HINT", "RESULT");
            for request in requests {
                let result = match request.result_code {
                    Some(code) => code.to_string(),
                    None => "pending".to_string(),
                };
                println!(
                    "{:<6} {:>4}  {:<12} {:<10}",
                    request.id,
                    request.target_ask,
                    request.hint_machine.as_deref().unwrap_or("-"),
                    result
                );
            }
        }
        (ClusterCommand::Machines { .. }, AdminResponse::Machines { machines }) => {
            println!("{:<20} {:<12} {}", "NAME", "ID", "STATUS");
            for machine in machines {
                println!(
                    "{:<20} {:<12} {:?}",
                    machine.name, machine.id, machine.status
                );
            }
        }
        _ => anyhow::bail!("unexpected admin response for this command"),
    }
    Ok(())
}

fn build_provider(config: &FleetdConfig) -> anyhow::Result<Arc<dyn CloudProvider>> {
    match &config.provider {
        ProviderConfig::Mock => {
            info!("using mock provider; machines exist only for this process");
            Ok(Arc::new(MockCloud::new()))
        }
        ProviderConfig::Hetzner {
            token,
            ssh_key_name,
        } => {
            let mut cloud = HetznerCloud::new(token.clone());
            if let Some(key_name) = ssh_key_name {
                cloud = cloud.with_ssh_key(key_name.clone());
            }
            info!("using hetzner provider");
            Ok(Arc::new(cloud))
        }
    }
}

fn load_ssh_key(config: &FleetdConfig) -> anyhow::Result<Option<SshKey>> {
    let Some(key_config) = &config.ssh_key else {
        return Ok(None);
    };
    let public_key = std::fs::read_to_string(&key_config.public_key_path)?;
    Ok(Some(SshKey {
        name: key_config.name.clone(),
        public_key: public_key.trim().to_string(),
    }))
}
