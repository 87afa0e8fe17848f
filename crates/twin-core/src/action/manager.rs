use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::condition::numeric_output;
use crate::dispatch::WorkDispatcher;
use crate::error::{RecordKind, Result, TwinError};
use crate::inference::ensure_predictions_enabled;
use crate::models::{
    new_id, Action, CreateActionRequest, DigitalTwin, Prediction, WorkTask, ACTION_TASK_PRIORITY,
    TASK_TYPE_PIPELINE_EXECUTION,
};
use crate::observability::{StructuredLogger, TwinMetrics};
use crate::store::MetadataStore;
use crate::twin::KeyedLocks;

/// Turns fresh predictions into dispatched pipeline work
pub struct ActionManager {
    store: Arc<dyn MetadataStore>,
    dispatcher: Arc<WorkDispatcher>,
    /// Serializes counter updates of one action across concurrent fires
    action_locks: KeyedLocks<String>,
    metrics: TwinMetrics,
    logger: StructuredLogger,
}

impl ActionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        dispatcher: Arc<WorkDispatcher>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            dispatcher,
            action_locks: KeyedLocks::new(),
            metrics: TwinMetrics::new(),
            logger,
        }
    }

    pub async fn create_action(
        &self,
        twin: &DigitalTwin,
        request: CreateActionRequest,
    ) -> Result<Action> {
        ensure_predictions_enabled(twin)?;

        if request.name.trim().is_empty() {
            return Err(TwinError::validation("action name must not be empty"));
        }
        if !request.condition.threshold.is_finite() {
            return Err(TwinError::validation("action threshold must be a finite number"));
        }
        if request.trigger.pipeline_id.trim().is_empty() {
            return Err(TwinError::validation("action trigger requires a pipeline_id"));
        }
        let model_id = &request.condition.model_id;
        if self.store.get_model(model_id).await?.is_none() {
            return Err(TwinError::not_found(RecordKind::Model, model_id.as_str()));
        }

        let action = Action {
            id: new_id(),
            twin_id: twin.id.clone(),
            name: request.name,
            enabled: request.enabled,
            condition: request.condition,
            trigger: request.trigger,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        };
        self.store.put_action(&action).await?;

        info!(
            twin_id = %twin.id,
            action_id = %action.id,
            model_id = %action.condition.model_id,
            operator = %action.condition.operator,
            threshold = action.condition.threshold,
            "Action created"
        );
        Ok(action)
    }

    pub async fn get_action(&self, twin_id: &str, action_id: &str) -> Result<Action> {
        self.store
            .get_action(action_id)
            .await?
            .filter(|a| a.twin_id == twin_id)
            .ok_or_else(|| TwinError::not_found(RecordKind::Action, action_id))
    }

    pub async fn list_actions(&self, twin_id: &str) -> Result<Vec<Action>> {
        self.store.list_actions(twin_id).await
    }

    pub async fn delete_action(&self, twin_id: &str, action_id: &str) -> Result<()> {
        self.get_action(twin_id, action_id).await?;
        self.store.delete_action(action_id).await?;
        Ok(())
    }

    /// Evaluate every enabled action of the twin against a fresh prediction.
    ///
    /// Returns the ids of the enqueued tasks. Only the action list fetch can
    /// fail the call; a failing trigger is logged and skipped.
    pub async fn evaluate_actions(
        &self,
        twin_id: &str,
        prediction: &Prediction,
    ) -> Result<Vec<String>> {
        let actions = self.store.list_actions(twin_id).await?;
        let mut task_ids = Vec::new();

        for action in actions {
            if !action.enabled || action.condition.model_id != prediction.model_id {
                continue;
            }
            // Non-numeric outputs never match
            let value = match numeric_output(&prediction.output) {
                Some(value) if action.condition.matches(&prediction.output) => value,
                Some(_) => continue,
                None => {
                    debug!(
                        action_id = %action.id,
                        prediction_id = %prediction.id,
                        "Prediction output is not numeric, action inert"
                    );
                    continue;
                }
            };

            match self.trigger_action(&action, prediction, value).await {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => {
                    self.metrics.inc_action_failures();
                    self.logger
                        .log_action_failed(twin_id, &action.id, &e.to_string());
                }
            }
        }

        Ok(task_ids)
    }

    /// Enqueue the pipeline task, then record the fire on the action.
    ///
    /// A persistence failure after the enqueue leaves the task dispatched.
    async fn trigger_action(
        &self,
        action: &Action,
        prediction: &Prediction,
        value: f64,
    ) -> Result<String> {
        let task = WorkTask::new(
            TASK_TYPE_PIPELINE_EXECUTION,
            ACTION_TASK_PRIORITY,
            json!({
                "pipeline_id": action.trigger.pipeline_id,
                "parameters": action.trigger.parameters,
                "action_id": action.id,
                "twin_id": action.twin_id,
                "prediction_id": prediction.id,
                "model_id": prediction.model_id,
                "entity_id": prediction.entity_id,
                "output": value,
            }),
        );
        let task_id = self.dispatcher.enqueue(task)?;
        self.metrics.inc_actions_triggered();
        self.logger
            .log_action_triggered(&action.twin_id, &action.id, &task_id, value);

        let _guard = self.action_locks.lock(action.id.clone()).await;
        let mut current = self.store.get_action(&action.id).await?.ok_or_else(|| {
            warn!(action_id = %action.id, task_id = %task_id, "Action removed after its task was enqueued");
            TwinError::not_found(RecordKind::Action, action.id.as_str())
        })?;
        current.trigger_count += 1;
        current.last_triggered_at = Some(Utc::now());
        self.store.put_action(&current).await?;

        Ok(task_id)
    }
}
