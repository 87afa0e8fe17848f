//! Observability infrastructure for the twin control loop
//!
//! Provides:
//! - Prometheus metrics (prediction latency, cache efficiency, triggers, queue depth)
//! - Structured JSON-friendly event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for inference latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TwinMetricsInner> = OnceLock::new();

struct TwinMetricsInner {
    prediction_latency_seconds: Histogram,
    predictions_generated: IntCounter,
    prediction_errors: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    actions_triggered: IntCounter,
    action_failures: IntCounter,
    tasks_enqueued: IntCounter,
    queue_depth: IntGauge,
    syncs_completed: IntCounter,
}

impl TwinMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "twin_prediction_latency_seconds",
                "Time spent loading artifacts and running model inference",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            predictions_generated: register_int_counter!(
                "twin_predictions_generated_total",
                "Fresh predictions computed by the inference engine"
            )
            .expect("Failed to register predictions_generated"),

            prediction_errors: register_int_counter!(
                "twin_prediction_errors_total",
                "Inference attempts that failed, including skipped batch rows"
            )
            .expect("Failed to register prediction_errors"),

            cache_hits: register_int_counter!(
                "twin_prediction_cache_hits_total",
                "Predictions served from the prediction cache"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_counter!(
                "twin_prediction_cache_misses_total",
                "Cache lookups that required a fresh inference"
            )
            .expect("Failed to register cache_misses"),

            actions_triggered: register_int_counter!(
                "twin_actions_triggered_total",
                "Actions whose condition matched and enqueued work"
            )
            .expect("Failed to register actions_triggered"),

            action_failures: register_int_counter!(
                "twin_action_failures_total",
                "Action triggers that failed to enqueue or persist"
            )
            .expect("Failed to register action_failures"),

            tasks_enqueued: register_int_counter!(
                "twin_tasks_enqueued_total",
                "Work tasks accepted by the dispatcher"
            )
            .expect("Failed to register tasks_enqueued"),

            queue_depth: register_int_gauge!(
                "twin_dispatcher_queue_depth",
                "Work tasks waiting to be dequeued"
            )
            .expect("Failed to register queue_depth"),

            syncs_completed: register_int_counter!(
                "twin_syncs_completed_total",
                "Successful twin synchronizations with source storage"
            )
            .expect("Failed to register syncs_completed"),
        }
    }
}

/// Handle to the process-wide Prometheus metrics.
///
/// Clones are cheap and share the same underlying collectors.
#[derive(Clone)]
pub struct TwinMetrics {
    _private: (),
}

impl Default for TwinMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TwinMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TwinMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TwinMetricsInner {
        GLOBAL_METRICS.get_or_init(TwinMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn inc_predictions_generated(&self) {
        self.inner().predictions_generated.inc();
    }

    pub fn inc_prediction_errors(&self) {
        self.inner().prediction_errors.inc();
    }

    pub fn inc_cache_hits(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_misses(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_actions_triggered(&self) {
        self.inner().actions_triggered.inc();
    }

    pub fn inc_action_failures(&self) {
        self.inner().action_failures.inc();
    }

    pub fn inc_tasks_enqueued(&self) {
        self.inner().tasks_enqueued.inc();
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner().queue_depth.set(depth);
    }

    pub fn inc_syncs_completed(&self) {
        self.inner().syncs_completed.inc();
    }
}

/// Structured logger for control-loop events
///
/// Every record carries an `event` field so downstream log pipelines can
/// filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_prediction(
        &self,
        twin_id: &str,
        model_id: &str,
        entity_id: Option<&str>,
        prediction_id: &str,
        confidence: f64,
        cached: bool,
    ) {
        info!(
            event = "prediction_generated",
            instance = %self.instance,
            twin_id = %twin_id,
            model_id = %model_id,
            entity_id = ?entity_id,
            prediction_id = %prediction_id,
            confidence = confidence,
            cached = cached,
            "Prediction served"
        );
    }

    pub fn log_action_triggered(&self, twin_id: &str, action_id: &str, task_id: &str, output: f64) {
        info!(
            event = "action_triggered",
            instance = %self.instance,
            twin_id = %twin_id,
            action_id = %action_id,
            task_id = %task_id,
            output = output,
            "Action condition matched, pipeline work enqueued"
        );
    }

    pub fn log_action_failed(&self, twin_id: &str, action_id: &str, error: &str) {
        warn!(
            event = "action_trigger_failed",
            instance = %self.instance,
            twin_id = %twin_id,
            action_id = %action_id,
            error = %error,
            "Action trigger failed, continuing with remaining actions"
        );
    }

    pub fn log_sync(&self, twin_id: &str, records: usize, created: usize, success: bool) {
        if success {
            info!(
                event = "twin_synced",
                instance = %self.instance,
                twin_id = %twin_id,
                records = records,
                entities_created = created,
                "Twin synchronized with source storage"
            );
        } else {
            warn!(
                event = "twin_sync_failed",
                instance = %self.instance,
                twin_id = %twin_id,
                "Twin synchronization failed"
            );
        }
    }

    pub fn log_task_transition(&self, task_id: &str, from: &str, to: &str) {
        info!(
            event = "task_status_changed",
            instance = %self.instance,
            task_id = %task_id,
            from = %from,
            to = %to,
            "Work task status changed"
        );
    }

    pub fn log_startup(&self, version: &str, port: u16) {
        info!(
            event = "server_started",
            instance = %self.instance,
            version = %version,
            port = port,
            "Digital twin server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Digital twin server shutting down"
        );
    }
}
