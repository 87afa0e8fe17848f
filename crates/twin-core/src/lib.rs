//! Digital twin control loop
//!
//! This crate provides the core functionality for:
//! - Merging authoritative source data with user overrides into live entities
//! - Cached, model-type dispatched inference over those entities
//! - What-if scenarios rendered over a non-persisted overlay
//! - Threshold actions that dispatch pipeline work on fresh predictions
//! - A priority work dispatcher consumed by external workers
//! - Health checks and observability

pub mod action;
pub mod collaborators;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod inference;
pub mod models;
pub mod observability;
pub mod registry;
pub mod scenario;
pub mod store;
pub mod twin;

pub use error::{ErrorKind, RecordKind, Result, TwinError};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TwinMetrics};
pub use twin::{DigitalTwinService, PredictionResponse, SyncReport};
