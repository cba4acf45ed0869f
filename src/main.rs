//! Record Vault daemon
//!
//! Loads the node topology, connects the ledger and usage store, then keeps
//! node health, load metrics, degraded replicas and stale sessions up to date
//! until shutdown.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use record_vault::chain::{ChainAdapter, ChainBackend};
use record_vault::config::{Config, StorageBackend};
use record_vault::quota::{InMemoryUsageStore, QuotaEngine, SqliteUsageStore, UsageStore};
use record_vault::storage::{MemoryNodeStore, NodeStore, S3NodeStore};
use record_vault::topology::{
    HttpNodeProbe, MetricsPoller, PlacementResolver, TopologyReloader, TopologySnapshot,
};
use record_vault::{OrchestratorSettings, UploadOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "record_vault=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Record Vault v{}", env!("CARGO_PKG_VERSION"));

    // Topology
    let topology = config.load_topology().context("Failed to load topology")?;
    let snapshot = TopologySnapshot::from_config(topology).context("Invalid topology")?;
    tracing::info!(
        nodes = snapshot.nodes().count(),
        logical_nodes = snapshot.logical_nodes().len(),
        "Topology loaded"
    );

    let nodes: Arc<dyn NodeStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(S3NodeStore::new(&snapshot, config.storage.create_buckets)),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory node store, chunks will not survive a restart");
            Arc::new(MemoryNodeStore::new())
        }
    };
    let placement = Arc::new(PlacementResolver::from_snapshot(snapshot, config.placement));

    // Ledger
    let chain = ChainBackend::from_config(&config.chain).context("Failed to initialize ledger")?;
    tracing::info!(chain = %chain.chain_type(), "Ledger backend selected");

    // Usage accounting
    let usage: Arc<dyn UsageStore> = match &config.database.url {
        Some(url) => {
            let store = SqliteUsageStore::connect(url)
                .await
                .context("Failed to initialize usage database")?;
            tracing::info!("Usage database initialized at {}", url);
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, usage counters are kept in memory");
            Arc::new(InMemoryUsageStore::new())
        }
    };
    let quota = QuotaEngine::new(usage, config.quota.policies.clone(), config.quota.mode);

    let orchestrator = UploadOrchestrator::new(
        placement.clone(),
        nodes.clone(),
        quota,
        chain,
        OrchestratorSettings::from_config(&config),
    );

    // Background tasks
    let probe = HttpNodeProbe::new(Duration::from_secs(config.monitor.probe_timeout_secs))
        .context("Failed to build node probe")?;
    let poller = MetricsPoller::new(
        placement.clone(),
        Arc::new(probe),
        Duration::from_secs(config.monitor.poll_interval_secs),
    )
    .start();

    let cleanup = orchestrator.sessions().clone().start_cleanup_task(
        chrono::Duration::hours(config.upload.session_ttl_hours),
        Duration::from_secs(config.upload.cleanup_interval_secs),
    );

    let repair = orchestrator.replicas().clone().start_repair_task(
        placement.clone(),
        Duration::from_secs(config.upload.repair_interval_secs),
    );

    let reloader = match (&config.topology_file, config.monitor.topology_reload_secs) {
        (Some(path), secs) if secs > 0 => Some(
            TopologyReloader::new(path.clone(), placement, nodes, Duration::from_secs(secs)).start(),
        ),
        _ => None,
    };

    let status = orchestrator.chain_status().await;
    if status.healthy {
        tracing::info!(
            chain = %status.chain_type,
            block_number = ?status.block_number,
            "Ledger reachable"
        );
    } else {
        tracing::warn!(chain = %status.chain_type, "Ledger unhealthy, finalize will be refused until it recovers");
    }

    shutdown_signal().await;

    poller.abort();
    cleanup.abort();
    repair.abort();
    if let Some(reloader) = reloader {
        reloader.abort();
    }

    if let Some(path) = &config.upload.export_file {
        match orchestrator.sessions().export_json(path).await {
            Ok(count) => tracing::info!(path = %path.display(), sessions = count, "Exported sessions"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to export sessions"),
        }
    }
    tracing::info!(
        active_sessions = orchestrator.sessions().active_count().await,
        degraded_replicas = orchestrator.replicas().tracker().len(),
        "Shutdown complete"
    );
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
