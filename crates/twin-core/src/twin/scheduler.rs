//! Background maintenance loop
//!
//! Periodically auto-syncs twins that ask for it, sweeps expired
//! predictions and prunes finished work tasks.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::service::DigitalTwinService;
use crate::health::{Component, HealthRegistry};

/// Default tick of the maintenance loop
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// How long finished tasks stay queryable
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub task_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_MAINTENANCE_INTERVAL,
            task_retention: DEFAULT_TASK_RETENTION,
        }
    }
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub twins_synced: usize,
    pub sync_failures: usize,
    pub predictions_swept: usize,
    pub tasks_pruned: usize,
}

pub struct MaintenanceScheduler {
    service: Arc<DigitalTwinService>,
    config: MaintenanceConfig,
    health: HealthRegistry,
}

impl MaintenanceScheduler {
    pub fn new(
        service: Arc<DigitalTwinService>,
        config: MaintenanceConfig,
        health: HealthRegistry,
    ) -> Self {
        Self {
            service,
            config,
            health,
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.task_retention.as_secs(),
            "Starting maintenance scheduler"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(?report, "Maintenance pass finished");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down maintenance scheduler");
                    break;
                }
            }
        }
    }

    /// One maintenance pass. Failures are logged and reflected in health.
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = Utc::now();
        // First metadata store failure of this pass
        let mut store_error: Option<String> = None;

        match self.service.twins_due_for_sync(now).await {
            Ok(due) => {
                for twin_id in due {
                    match self.service.sync_with_storage(&twin_id).await {
                        Ok(_) => report.twins_synced += 1,
                        Err(e) => {
                            report.sync_failures += 1;
                            warn!(twin_id = %twin_id, error = %e, "Auto-sync failed");
                        }
                    }
                }
                if report.sync_failures == 0 {
                    self.health.set_healthy(Component::Sync).await;
                } else {
                    self.health
                        .set_degraded(
                            Component::Sync,
                            format!("{} twin syncs failed", report.sync_failures),
                        )
                        .await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list twins for auto-sync");
                store_error.get_or_insert(e.to_string());
            }
        }

        match self.service.sweep_expired_predictions(now).await {
            Ok(removed) => report.predictions_swept = removed,
            Err(e) => {
                warn!(error = %e, "Prediction sweep failed");
                store_error.get_or_insert(e.to_string());
            }
        }

        match store_error {
            None => self.health.set_healthy(Component::MetadataStore).await,
            Some(message) => {
                self.health
                    .set_unhealthy(Component::MetadataStore, message)
                    .await
            }
        }

        match self
            .service
            .dispatcher()
            .prune_finished(self.config.task_retention)
        {
            Ok(pruned) => {
                report.tasks_pruned = pruned;
                self.health.set_healthy(Component::Dispatcher).await;
            }
            Err(e) => {
                warn!(error = %e, "Task pruning failed");
                self.health
                    .set_unhealthy(Component::Dispatcher, e.to_string())
                    .await;
            }
        }

        report
    }
}
