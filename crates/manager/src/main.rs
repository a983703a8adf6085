//! Voice Insight Worker Manager - Main Entry Point
//!
//! Loads the model catalog, serves the manager API and reaps idle workers
//! until interrupted, then stops every worker it started.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voice_insight_common::ManagerConfig;
use voice_insight_manager::{
    api, spawn_idle_reaper, HttpHealthProbe, ModelCatalog, OsLauncher, RegistrySettings,
    Supervisor, SystemMemoryOracle, WorkerRegistry,
};

/// Per-request timeout of the worker health probe
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("VOICE_INSIGHT_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = ManagerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    let observability = config.observability();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("voice_insight_manager={},axum=info", observability.log_level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Voice Insight Worker Manager");

    let catalog = ModelCatalog::from_config(&config.models);
    info!(
        models = catalog.len(),
        "Model catalog loaded from {}: {}",
        config_path,
        catalog.aliases().collect::<Vec<_>>().join(", ")
    );

    let probe = HttpHealthProbe::new(HEALTH_PROBE_TIMEOUT)?;
    let supervisor = Supervisor::new(
        Arc::new(OsLauncher),
        Arc::new(probe),
        config.workers.health_poll_interval(),
        config.workers.termination_grace(),
    );
    let workers = Arc::new(WorkerRegistry::new(
        catalog,
        Arc::new(SystemMemoryOracle::new()),
        supervisor,
        RegistrySettings::from_config(&config),
    ));

    // Start idle reaper
    let reaper_handle = spawn_idle_reaper(workers.clone(), config.workers.reaper_interval());

    let address = config.workers.listen_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind manager API to {}", address))?;
    info!(
        idle_timeout_secs = config.workers.idle_timeout_seconds,
        safety_margin_gb = config.memory.safety_margin_gb,
        "Worker manager listening on {}",
        listener.local_addr()?
    );

    let app = api::router(workers.clone(), observability.enable_metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Manager API server failed")?;

    reaper_handle.abort();
    let stopped = workers.stop_all().await;
    info!(stopped, "Voice Insight Worker Manager shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}
