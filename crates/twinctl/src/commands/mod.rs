pub mod models;
pub mod predict;
pub mod tasks;
pub mod twins;
