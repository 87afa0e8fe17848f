use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::DispatchError;
use crate::models::{TaskStatus, WorkTask};
use crate::observability::TwinMetrics;

/// Urgency score of a task; lower dequeues first.
///
/// `submission_unix_secs / (priority + 1)`: a larger declared priority
/// shrinks the score, and among equal priorities the older task wins.
pub fn urgency_score(task: &WorkTask) -> f64 {
    task.submitted_at.timestamp() as f64 / (task.priority as f64 + 1.0)
}

#[derive(Debug)]
struct QueueEntry {
    score: f64,
    /// Insertion order, breaks score ties FIFO
    seq: u64,
    task_id: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct DispatcherState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    /// Every known task by id, including dequeued and finished ones
    tasks: HashMap<String, WorkTask>,
    /// Ids whose heap entry is still live. Entries for ids missing here
    /// were withdrawn and are skipped on dequeue.
    pending: HashSet<String>,
    next_seq: u64,
}

/// Snapshot of dispatcher occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub executing: usize,
    pub finished: usize,
}

/// Thread-safe priority dispatcher. Heap and side table share one lock so
/// a task is never visible in one without the other.
pub struct WorkDispatcher {
    state: Mutex<DispatcherState>,
    work_available: Notify,
    metrics: TwinMetrics,
}

impl Default for WorkDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkDispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DispatcherState::default()),
            work_available: Notify::new(),
            metrics: TwinMetrics::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DispatcherState>, DispatchError> {
        self.state.lock().map_err(|_| DispatchError::LockPoisoned)
    }

    /// Add a queued task; returns its id
    pub fn enqueue(&self, task: WorkTask) -> Result<String, DispatchError> {
        if task.priority < 0 {
            return Err(DispatchError::InvalidPriority(task.priority));
        }

        let mut state = self.lock()?;
        if let Some(existing) = state.tasks.get(&task.id) {
            return Err(DispatchError::InvalidTransition {
                id: task.id.clone(),
                from: existing.status,
                to: TaskStatus::Queued,
            });
        }
        if task.status != TaskStatus::Queued {
            return Err(DispatchError::InvalidTransition {
                id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Queued,
            });
        }

        let score = urgency_score(&task);
        let seq = state.next_seq;
        state.next_seq += 1;

        let id = task.id.clone();
        state.heap.push(Reverse(QueueEntry {
            score,
            seq,
            task_id: id.clone(),
        }));
        state.pending.insert(id.clone());
        debug!(task_id = %id, task_type = %task.task_type, priority = task.priority, score, "Task enqueued");
        state.tasks.insert(id.clone(), task);

        self.metrics.inc_tasks_enqueued();
        self.metrics.set_queue_depth(state.pending.len() as i64);
        drop(state);

        self.work_available.notify_one();
        Ok(id)
    }

    /// Pop the most urgent task. It stays in the side table for status
    /// tracking.
    pub fn dequeue(&self) -> Result<Option<WorkTask>, DispatchError> {
        let mut state = self.lock()?;

        while let Some(Reverse(entry)) = state.heap.pop() {
            if !state.pending.remove(&entry.task_id) {
                continue;
            }
            self.metrics.set_queue_depth(state.pending.len() as i64);
            if let Some(task) = state.tasks.get(&entry.task_id) {
                debug!(task_id = %task.id, score = entry.score, "Task dequeued");
                return Ok(Some(task.clone()));
            }
        }

        Ok(None)
    }

    /// Dequeue, parking the caller until work arrives or `timeout` lapses
    pub async fn dequeue_wait(&self, timeout: Duration) -> Result<Option<WorkTask>, DispatchError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.dequeue()? {
                return Ok(Some(task));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Result<Option<WorkTask>, DispatchError> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    /// Apply a status transition. `executing` stamps the start time and any
    /// terminal status stamps the completion time.
    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<WorkTask, DispatchError> {
        let mut state = self.lock()?;

        let current = state
            .tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;

        if !current.can_transition_to(status) {
            return Err(DispatchError::InvalidTransition {
                id: task_id.to_string(),
                from: current,
                to: status,
            });
        }

        if current == TaskStatus::Queued && state.pending.remove(task_id) {
            self.metrics.set_queue_depth(state.pending.len() as i64);
        }

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;

        let now = Utc::now();
        task.status = status;
        if status == TaskStatus::Executing {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        if error.is_some() {
            task.error = error;
        }

        info!(task_id = %task_id, from = %current, to = %status, "Task status updated");
        Ok(task.clone())
    }

    /// Withdraw a task before a worker picks it up
    pub fn cancel(&self, task_id: &str) -> Result<WorkTask, DispatchError> {
        self.update_status(task_id, TaskStatus::Cancelled, None)
    }

    /// Number of tasks waiting to be dequeued
    pub fn len(&self) -> Result<usize, DispatchError> {
        Ok(self.lock()?.pending.len())
    }

    pub fn is_empty(&self) -> Result<bool, DispatchError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<DispatcherStats, DispatchError> {
        let state = self.lock()?;
        let mut stats = DispatcherStats {
            queued: state.pending.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Executing => stats.executing += 1,
                s if s.is_terminal() => stats.finished += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Drop finished tasks whose completion is older than `retention`
    pub fn prune_finished(&self, retention: Duration) -> Result<usize, DispatchError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.lock()?;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| match task.completed_at {
            Some(done) if task.status.is_terminal() => done > cutoff,
            _ => true,
        });
        Ok(before - state.tasks.len())
    }
}
