//! Priority work dispatcher
//!
//! In-memory priority queue of work tasks consumed by external workers.
//! Tasks are ordered by an urgency score that blends submission time and
//! declared priority; the full task record is kept in a side table for
//! status tracking after it leaves the queue.

mod queue;

pub use queue::{urgency_score, DispatcherStats, WorkDispatcher};

use crate::models::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid task priority {0}")]
    InvalidPriority(i32),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("dispatcher lock poisoned")]
    LockPoisoned,
}
