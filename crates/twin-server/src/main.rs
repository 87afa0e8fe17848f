//! twin-server - digital twin control loop service
//!
//! Keeps entity state, serves cached predictions, runs scenarios, fires
//! threshold actions and dispatches pipeline work to external workers.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use twin_core::{
    collaborators::{StaticOntologyService, StaticStorageService},
    dispatch::WorkDispatcher,
    inference::PredictorRegistry,
    store::InMemoryMetadataStore,
    twin::MaintenanceScheduler,
    Component, DigitalTwinService, HealthRegistry, StructuredLogger,
};
use twin_server::{api, seed::SeedData, AppState, ServerConfig};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting twin-server");

    let config = ServerConfig::load()?;
    info!(
        instance = %config.instance,
        api_port = config.api_port,
        "Server configured"
    );

    let health_registry = HealthRegistry::new();
    for component in [
        Component::MetadataStore,
        Component::Inference,
        Component::Dispatcher,
        Component::Sync,
    ] {
        health_registry.register(component).await;
    }

    let logger = StructuredLogger::new(&config.instance);

    let ontology = Arc::new(StaticOntologyService::new());
    let storage = Arc::new(StaticStorageService::new());
    if let Some(path) = &config.seed_file {
        SeedData::load(path)
            .await
            .context("seed data unavailable")?
            .install(&ontology, &storage);
    }

    let service = Arc::new(DigitalTwinService::new(
        Arc::new(InMemoryMetadataStore::new()),
        ontology,
        storage,
        Arc::new(WorkDispatcher::new()),
        PredictorRegistry::with_defaults(),
        config.engine_config(),
        logger.clone(),
    ));

    // Background maintenance: auto-sync, prediction sweep, task pruning
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Arc::new(MaintenanceScheduler::new(
        service.clone(),
        config.maintenance_config(),
        health_registry.clone(),
    ));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let app_state = Arc::new(AppState::new(
        service,
        health_registry.clone(),
        logger.clone(),
    ));

    health_registry.set_ready(true).await;
    logger.log_startup(SERVER_VERSION, config.api_port);

    api::serve(config.api_port, app_state, shutdown_signal()).await?;

    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Maintenance scheduler did not stop cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
