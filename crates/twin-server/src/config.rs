//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use twin_core::inference::EngineConfig;
use twin_core::twin::MaintenanceConfig;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "TWIN_CONFIG_FILE";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Instance name stamped on structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port of the admin/worker API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Upper bound on reading a model artifact
    #[serde(default = "default_artifact_load_timeout_ms")]
    pub artifact_load_timeout_ms: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// How long finished tasks stay queryable
    #[serde(default = "default_task_retention")]
    pub task_retention_secs: u64,

    /// JSON file with ontologies, storages and their records
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "twin-server".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_artifact_load_timeout_ms() -> u64 {
    5000
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_task_retention() -> u64 {
    86_400
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            api_port: default_api_port(),
            artifact_load_timeout_ms: default_artifact_load_timeout_ms(),
            maintenance_interval_secs: default_maintenance_interval(),
            task_retention_secs: default_task_retention(),
            seed_file: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the optional config file and `TWIN_*` variables.
    /// Environment values win over the file.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("TWIN").try_parsing(true))
            .build()
            .context("failed to read server configuration")?;

        config
            .try_deserialize()
            .context("invalid server configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            artifact_load_timeout: Duration::from_millis(self.artifact_load_timeout_ms),
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(self.maintenance_interval_secs.max(1)),
            task_retention: Duration::from_secs(self.task_retention_secs),
        }
    }
}
