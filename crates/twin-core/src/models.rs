//! Core data models for the digital twin platform

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::action::Operator;

/// Attribute bag keyed by attribute name. Ordered so that serialized
/// entities are byte-stable.
pub type AttributeMap = BTreeMap<String, Value>;

/// Prediction cache TTL used when a twin does not configure one (30 minutes)
pub const DEFAULT_PREDICTION_TTL_SECS: u64 = 1800;

/// Longest accepted prediction cache TTL (one year)
pub const MAX_PREDICTION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted auto-sync interval (one year)
pub const MAX_SYNC_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Base state label applied to scenarios that do not name one
pub const DEFAULT_BASE_STATE: &str = "current";

/// Task type tag for work produced by fired actions
pub const TASK_TYPE_PIPELINE_EXECUTION: &str = "pipeline_execution";

/// Priority assigned to every task enqueued by an action trigger
pub const ACTION_TASK_PRIORITY: i32 = 8;

pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Per-twin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    /// Entity view cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Periodically re-sync from source storage
    pub auto_sync: bool,
    /// Interval between automatic syncs in seconds
    pub sync_interval_secs: u64,
    /// Gate for every prediction and action entry point
    pub enable_predictions: bool,
    /// Prediction cache TTL in seconds; `None` or zero falls back to the default
    pub prediction_cache_ttl_secs: Option<u64>,
    pub indexing_strategy: String,
    /// Source storage references consulted by sync
    pub storage_ids: Vec<String>,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            auto_sync: false,
            sync_interval_secs: 300,
            enable_predictions: true,
            prediction_cache_ttl_secs: None,
            indexing_strategy: "default".to_string(),
            storage_ids: Vec::new(),
        }
    }
}

impl TwinConfig {
    /// Effective prediction cache TTL
    ///
    /// Values above [`MAX_PREDICTION_TTL_SECS`] are clamped to it.
    pub fn prediction_ttl(&self) -> Duration {
        let secs = match self.prediction_cache_ttl_secs {
            Some(ttl) if ttl > 0 => ttl.min(MAX_PREDICTION_TTL_SECS),
            _ => DEFAULT_PREDICTION_TTL_SECS,
        };
        bounded_seconds(secs)
    }

    /// Effective auto-sync interval, clamped to [`MAX_SYNC_INTERVAL_SECS`]
    pub fn sync_interval(&self) -> Duration {
        bounded_seconds(self.sync_interval_secs.min(MAX_SYNC_INTERVAL_SECS))
    }
}

fn bounded_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// A modeled instance of a real-world system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalTwin {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub ontology_id: String,
    pub config: TwinConfig,
    #[serde(default)]
    pub metadata: AttributeMap,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One modeled object within a twin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub twin_id: String,
    pub entity_type: String,
    /// Authoritative source record this entity is bound to
    pub source_record_id: Option<String>,
    /// Merged view: last synced source values overlaid by `modifications`
    pub attributes: AttributeMap,
    /// User-supplied deltas only
    pub modifications: AttributeMap,
    pub is_modified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Empty template for an ontology entity type
    pub fn template(twin_id: &str, entity_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            twin_id: twin_id.to_string(),
            entity_type: entity_type.to_string(),
            source_record_id: None,
            attributes: AttributeMap::new(),
            modifications: AttributeMap::new(),
            is_modified: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge user deltas into both the delta map and the live view
    pub fn apply_modifications(&mut self, deltas: &AttributeMap) {
        for (key, value) in deltas {
            self.modifications.insert(key.clone(), value.clone());
            self.attributes.insert(key.clone(), value.clone());
        }
        self.is_modified = !self.modifications.is_empty();
        self.updated_at = Utc::now();
    }

    /// Re-derive the live view from fresh source values
    pub fn rebase(&mut self, source_values: &AttributeMap) {
        let mut attributes = source_values.clone();
        for (key, value) in &self.modifications {
            attributes.insert(key.clone(), value.clone());
        }
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }
}

/// Model lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Draft,
    Training,
    Trained,
    Failed,
}

impl ModelStatus {
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (ModelStatus::Draft, ModelStatus::Training)
                | (ModelStatus::Training, ModelStatus::Trained)
                | (ModelStatus::Training, ModelStatus::Failed)
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Draft => write!(f, "draft"),
            ModelStatus::Training => write!(f, "training"),
            ModelStatus::Trained => write!(f, "trained"),
            ModelStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A prediction model tracked by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModel {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub model_type: String,
    pub status: ModelStatus,
    pub artifact_path: Option<String>,
    /// SHA256 of the artifact recorded when training completed
    pub artifact_checksum: Option<String>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionKind {
    Point,
    Batch,
}

/// A model output for one entity/model pair, with an expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub twin_id: String,
    pub model_id: String,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub kind: PredictionKind,
    pub input: AttributeMap,
    pub output: Value,
    pub confidence: f64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Prediction {
    /// Whether this prediction may be served for the given request at `now`
    pub fn is_reusable_for(
        &self,
        model_id: &str,
        entity_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        now < self.expires_at
            && self.model_id == model_id
            && self.entity_id.as_deref() == entity_id
    }
}

/// A single attribute override inside a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioModification {
    pub entity_id: String,
    pub attribute: String,
    pub value: Value,
}

/// Prediction produced inside a scenario run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPrediction {
    pub entity_id: String,
    pub entity_type: String,
    pub model_id: String,
    /// Output computed from the live, non-overlaid attributes
    pub baseline_output: Option<Value>,
    pub output: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Created,
    Completed,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub twin_id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_state: String,
    pub modifications: Vec<ScenarioModification>,
    pub model_ids: Vec<String>,
    pub predictions: Vec<ScenarioPrediction>,
    pub status: ScenarioStatus,
    pub created_at: DateTime<Utc>,
}

/// Threshold rule evaluated against fresh predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub model_id: String,
    pub operator: Operator,
    pub threshold: f64,
}

/// Pipeline work dispatched when a condition matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub pipeline_id: String,
    #[serde(default)]
    pub parameters: AttributeMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub twin_id: String,
    pub name: String,
    pub enabled: bool,
    pub condition: Condition,
    pub trigger: Trigger,
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Work task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Executing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// Monotonic state machine: queued -> executing -> terminal, and
    /// queued -> cancelled for work withdrawn before pickup.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Queued => matches!(next, TaskStatus::Executing | TaskStatus::Cancelled),
            TaskStatus::Executing => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Unit of dispatchable work consumed by an external worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkTask {
    pub id: String,
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque task specification
    pub spec: Value,
    pub error: Option<String>,
}

impl WorkTask {
    pub fn new(task_type: impl Into<String>, priority: i32, spec: Value) -> Self {
        Self {
            id: new_id(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            spec,
            error: None,
        }
    }
}

// Requests accepted by the services

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTwinRequest {
    pub name: String,
    pub project_id: String,
    pub ontology_id: String,
    #[serde(default)]
    pub config: Option<TwinConfig>,
    #[serde(default)]
    pub metadata: AttributeMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTwinRequest {
    pub name: Option<String>,
    pub config: Option<TwinConfig>,
    pub metadata: Option<AttributeMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub model_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub input: AttributeMap,
    /// Serve an unexpired cached prediction when one exists
    #[serde(default)]
    pub use_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionRequest {
    pub model_id: String,
    pub inputs: Vec<AttributeMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScenarioRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base_state: Option<String>,
    #[serde(default)]
    pub modifications: Vec<ScenarioModification>,
    /// Models evaluated when `run_predictions` is set
    #[serde(default)]
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub run_predictions: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionRequest {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModelRequest {
    pub project_id: String,
    pub name: String,
    pub model_type: String,
}

/// Status report sent by the out-of-process trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusUpdate {
    pub status: ModelStatus,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub error: Option<String>,
}
