//! Conditional actions
//!
//! Standing rules that compare a fresh prediction against a threshold and
//! hand pipeline work to the dispatcher when satisfied.

mod condition;
mod manager;

pub use condition::{numeric_output, Operator};
pub use manager::ActionManager;
