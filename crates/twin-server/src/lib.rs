//! Digital twin server
//!
//! Hosts the control loop behind an HTTP API used by operators and by the
//! external workers that consume dispatched pipeline tasks.

pub mod api;
pub mod config;
pub mod seed;

pub use api::{create_router, serve, AppState};
pub use config::ServerConfig;
