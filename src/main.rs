//! `wagd`: clustered remote-access gateway daemon.
//!
//! Boot order: load the node config, migrate the legacy database if one is
//! present, start the replicated store and wait for the cluster, seed
//! first-run state, repair any interrupted multi-key operations, then wire
//! the session sweep, the reconciler with its health gate, and the control
//! socket. Shutdown fans out through a single watch channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wag_control::socket_path;
use wag_control::ControlServer;
use wag_core::Config;
use wag_raft::node::STARTUP_TIMEOUT;
use wag_raft::HealthMonitor;
use wag_raft::RaftNode;
use wag_reconciler::Dataplane;
use wag_reconciler::Reconciler;
use wag_reconciler::SessionTracker;
use wag_reconciler::TrackingDataplane;
use wag_registry::EventDispatcher;
use wag_registry::Registry;
use wag_store::Store;

#[derive(Parser)]
#[command(name = "wagd", about = "Clustered WireGuard remote-access gateway", version)]
struct Args {
    /// Node configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the control socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).context("unable to load configuration")?;
    info!(node = %config.clustering.name, "starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let node = RaftNode::start(&config.clustering, shutdown_rx.clone())
        .await
        .context("unable to start the replicated store")?;
    node.wait_ready(STARTUP_TIMEOUT).await.context("store did not become ready")?;
    info!(node_id = node.node_id(), "store ready");

    let store: Arc<dyn Store> = node.store();
    let registry = Registry::new(store.clone(), node.node_id());

    if let Some(legacy) = &config.database_path {
        if legacy.exists() {
            registry
                .migrate_legacy_sql(legacy)
                .await
                .context("legacy database import failed")?;
        }
    }
    registry.seed_from_config(&config).await.context("first-run seeding failed")?;
    registry.repair_device_refs().await.context("device reference repair failed")?;

    let dispatcher = EventDispatcher::new(store);
    let dataplane: Arc<dyn Dataplane> = Arc::new(TrackingDataplane::new());

    let sessions = SessionTracker::new(registry.clone());
    tokio::spawn(sessions.clone().run(shutdown_rx.clone()));

    let reconciler = Reconciler::new(registry.clone(), dispatcher, dataplane.clone(), sessions);
    reconciler.start().await.context("reconciler startup failed")?;

    let monitor = HealthMonitor::new(node.node_id(), node.status_channel());
    let (health_tx, health_rx) = mpsc::unbounded_channel();
    monitor.register_listener(move |health| {
        let _ = health_tx.send(health);
    });
    tokio::spawn(monitor.clone().run(shutdown_rx.clone()));
    tokio::spawn(reconciler.clone().run_health_gate(health_rx, shutdown_rx.clone()));

    let _control = ControlServer::start(
        &socket_path(args.socket.as_deref()),
        registry.clone(),
        dataplane.clone(),
        shutdown_rx.clone(),
    )
    .await
    .context("unable to start the control socket")?;

    info!("gateway control plane running");
    tokio::signal::ctrl_c().await.context("unable to wait for shutdown signal")?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    reconciler.stop().await;
    node.shutdown().await;
    Ok(())
}
