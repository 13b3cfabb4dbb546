//! Subsystem assembly for the daemon and its one-shot commands.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fleet_core::FleetConfig;
use fleetgrid_api::ApiState;
use fleetgrid_autoscale::{FleetService, FleetServiceSettings, PoolTickResult, TickReport};
use fleetgrid_lifecycle::{LifecycleService, LifecycleServiceSettings, LoggingLifecycleHook};
use fleetgrid_state::StateStore;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DB_FILE: &str = "fleetgrid.redb";

pub fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Open the store under `data_dir` and bring pool configuration in line
/// with `config`.
fn open_store(data_dir: &Path, config: &FleetConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    store.sync_pool_configs(&config.pools)?;
    info!(pools = config.pools.len(), "pool configuration synced");
    Ok(store)
}

fn fleet_service(store: StateStore, config: &FleetConfig) -> anyhow::Result<FleetService> {
    let settings = FleetServiceSettings::from_config(&config.fleet)?;
    Ok(FleetService::new(store, settings).with_downtime(Arc::new(config.downtime_schedule())))
}

pub async fn tick_once(config_path: &Path, data_dir: &Path) -> anyhow::Result<TickReport> {
    let config = load_config(config_path)?;
    let store = open_store(data_dir, &config)?;
    let fleet = fleet_service(store, &config)?;
    Ok(fleet.tick(&CancellationToken::new()).await?)
}

pub async fn scale_pool_once(
    config_path: &Path,
    data_dir: &Path,
    pool_id: &str,
) -> anyhow::Result<PoolTickResult> {
    let config = load_config(config_path)?;
    let store = open_store(data_dir, &config)?;
    let fleet = fleet_service(store, &config)?;
    Ok(fleet
        .calculate_and_scale(pool_id, &CancellationToken::new())
        .await?)
}

pub async fn run(config_path: &Path, data_dir: &Path, port: Option<u16>) -> anyhow::Result<()> {
    info!("fleetgrid daemon starting");

    let config = load_config(config_path)?;
    let store = open_store(data_dir, &config)?;

    // ── Initialize subsystems ──────────────────────────────────

    let tick_interval = config.fleet.tick_interval()?;
    let fleet = fleet_service(store.clone(), &config)?;
    info!(
        interval_secs = tick_interval.as_secs(),
        enabled = fleet.settings().autoscaling_enabled,
        "fleet orchestrator initialized"
    );

    let lifecycle = LifecycleService::new(
        store.clone(),
        Arc::new(LoggingLifecycleHook),
        LifecycleServiceSettings::from_config(&config.lifecycle)?,
    );
    let (intent_tx, intent_rx) = mpsc::channel(config.lifecycle.queue_capacity);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let fleet_loop = fleet.clone();
    let fleet_shutdown = shutdown_rx.clone();
    let fleet_handle = tokio::spawn(async move {
        fleet_loop.run(tick_interval, fleet_shutdown).await;
    });

    // Dropping the receiver makes the API answer 503 for lifecycle events.
    let lifecycle_handle = if config.lifecycle.enabled {
        let lifecycle_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            lifecycle.run(intent_rx, lifecycle_shutdown).await;
        }))
    } else {
        info!("lifecycle reconciler disabled");
        drop(intent_rx);
        None
    };

    // ── Start API server ───────────────────────────────────────

    let router = fleetgrid_api::build_router(ApiState {
        store,
        fleet,
        intents: intent_tx,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.api.port)));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = fleet_handle.await;
    if let Some(handle) = lifecycle_handle {
        let _ = handle.await;
    }

    info!("fleetgrid daemon stopped");
    Ok(())
}
