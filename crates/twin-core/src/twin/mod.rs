//! Digital twin service
//!
//! Entity store and control-loop entry points, per-key locking and the
//! background maintenance scheduler.

mod locks;
mod scheduler;
mod service;

pub use locks::KeyedLocks;
pub use scheduler::{
    MaintenanceConfig, MaintenanceReport, MaintenanceScheduler, DEFAULT_MAINTENANCE_INTERVAL,
    DEFAULT_TASK_RETENTION,
};
pub use service::{DigitalTwinService, PredictionResponse, SyncReport};
