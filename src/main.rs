use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::lib::{
    api::{server::ControlPlaneServer, types::AppState},
    config::ControlPlaneConfig,
    fleet::{
        accounts::InMemoryAccounts,
        registry::{FleetRegistry, InMemoryFleet},
        types::FleetSnapshot,
    },
    manager::types::Dispatcher,
    monitor::monitor::Monitor,
    tasks::{clock::SystemClock, store::InMemoryTaskStore},
    worker::{
        haproxy::register_haproxy_handlers,
        runner::{HandlerRegistry, WorkerAgent},
        types::LeaseProtocol,
    },
};

mod lib {
    pub mod api;
    pub mod config;
    pub mod fleet;
    pub mod manager;
    pub mod monitor;
    pub mod tasks;
    pub mod worker;
}

/// Task dispatch control plane for a fleet of workers.
#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch", version, about)]
struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, env = "FLEET_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Lease granted on claim and on every heartbeat, in seconds
    #[arg(long, env = "FLEET_LEASE_SECS", default_value_t = 60)]
    lease_secs: u64,

    /// Pause between lease monitor sweeps, in seconds
    #[arg(long, env = "FLEET_SWEEP_SECS", default_value_t = 5)]
    sweep_secs: u64,

    /// Lease expiries tolerated before a task is failed
    #[arg(long, env = "FLEET_MAX_REQUEUES", default_value_t = 3)]
    max_requeues: u32,

    /// List size when a request gives no limit
    #[arg(long, env = "FLEET_DEFAULT_LIMIT", default_value_t = 30)]
    default_limit: usize,

    /// Hard cap on list sizes
    #[arg(long, env = "FLEET_GLOBAL_LIMIT", default_value_t = 1000)]
    global_limit: usize,

    /// In-process workers to run alongside the API (0 = external workers only)
    #[arg(long, env = "FLEET_LOCAL_WORKERS", default_value_t = 0)]
    local_workers: usize,

    /// Idle poll interval for in-process workers, in milliseconds
    #[arg(long, env = "FLEET_WORKER_POLL_MS", default_value_t = 500)]
    worker_poll_ms: u64,

    /// JSON file with the initial servers, workers, groups and configs
    #[arg(long, env = "FLEET_REGISTRY")]
    registry: Option<PathBuf>,

    /// Email of the account created at startup
    #[arg(long, env = "FLEET_ROOT_EMAIL", default_value = "root@localhost")]
    root_email: String,

    /// Access key for the root account; generated when absent
    #[arg(long, env = "FLEET_ROOT_ACCESS_KEY", hide_env_values = true)]
    root_access_key: Option<String>,
}

impl Cli {
    fn config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig::new(self.bind)
            .with_lease_duration(Duration::from_secs(self.lease_secs.max(1)))
            .with_sweep_interval(Duration::from_secs(self.sweep_secs.max(1)))
            .with_max_requeues(self.max_requeues)
            .with_limits(self.default_limit, self.global_limit)
            .with_worker_poll_interval(Duration::from_millis(self.worker_poll_ms.max(1)))
            .with_local_workers(self.local_workers)
    }
}

fn load_fleet(path: Option<&PathBuf>) -> anyhow::Result<InMemoryFleet> {
    let Some(path) = path else {
        tracing::warn!("No registry file given; starting with an empty fleet");
        return Ok(InMemoryFleet::new());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read registry file {}", path.display()))?;
    let snapshot: FleetSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse registry file {}", path.display()))?;
    let fleet = InMemoryFleet::from_snapshot(snapshot).context("invalid registry file")?;

    tracing::info!(
        "Loaded registry from {}: {} servers, {} workers, {} groups",
        path.display(),
        fleet.list_servers(usize::MAX).len(),
        fleet.list_workers(usize::MAX).len(),
        fleet.list_groups(usize::MAX).len()
    );
    Ok(fleet)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(cli.config());
    tracing::info!("Starting control plane: {:?}", config);

    let fleet: Arc<dyn FleetRegistry> = Arc::new(load_fleet(cli.registry.as_ref())?);
    let accounts = InMemoryAccounts::new();
    let root_key = accounts.add_user(&cli.root_email, cli.root_access_key.as_deref());
    if cli.root_access_key.is_none() {
        tracing::info!("Generated access key for {}: {}", cli.root_email, root_key);
    }

    let store = Arc::new(InMemoryTaskStore::new());
    let clock = Arc::new(SystemClock);
    let dispatcher = Dispatcher::new(store.clone(), fleet.clone(), clock.clone(), config.clone());
    let leases = LeaseProtocol::new(store.clone(), clock.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let monitor = Monitor::new(
        store.clone(),
        clock.clone(),
        config.max_requeues,
        config.sweep_interval,
    );
    background.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    if config.local_workers > 0 {
        let handlers = HandlerRegistry::new();
        register_haproxy_handlers(&handlers, fleet.clone());

        for i in 0..config.local_workers {
            let agent = WorkerAgent::new(
                &format!("local-{}", i + 1),
                dispatcher.clone(),
                leases.clone(),
                handlers.clone(),
            );
            background.push(tokio::spawn(agent.run(shutdown_rx.clone())));
        }
    }

    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
            let _ = shutdown_tx.send(true);
        }
    });

    let state = AppState {
        dispatcher,
        leases,
        fleet,
        accounts: Arc::new(accounts),
        config,
    };
    let served = ControlPlaneServer::new(state).start_server(shutdown_rx).await;
    // Also stops the background tasks when the server exits on its own.
    let _ = shutdown_tx.send(true);

    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    served
}
