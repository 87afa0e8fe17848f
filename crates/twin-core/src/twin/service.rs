use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::locks::KeyedLocks;
use crate::action::ActionManager;
use crate::collaborators::{OntologyService, SourceRecord, StorageService};
use crate::dispatch::WorkDispatcher;
use crate::error::{ErrorKind, RecordKind, Result, TwinError};
use crate::inference::{
    ensure_predictions_enabled, EngineConfig, InferenceEngine, PredictionCache,
    PredictorRegistry,
};
use crate::models::{
    new_id, Action, AttributeMap, BatchPredictionRequest, CreateActionRequest,
    CreateScenarioRequest, CreateTwinRequest, DigitalTwin, Entity, Prediction, PredictionRequest,
    Scenario, TwinConfig, UpdateTwinRequest, MAX_PREDICTION_TTL_SECS, MAX_SYNC_INTERVAL_SECS,
};
use crate::observability::{StructuredLogger, TwinMetrics};
use crate::registry::ModelRegistry;
use crate::scenario::ScenarioManager;
use crate::store::MetadataStore;

/// Answer to a point prediction request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: Prediction,
    pub from_cache: bool,
    /// Work tasks enqueued by actions that matched this prediction
    pub triggered_tasks: Vec<String>,
}

/// Outcome of one storage synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub twin_id: String,
    pub records: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub synced_at: DateTime<Utc>,
}

/// Front door of the control loop.
///
/// Owns the merged entity view and wires prediction results into action
/// evaluation. Every collaborator is injected at construction.
pub struct DigitalTwinService {
    store: Arc<dyn MetadataStore>,
    ontology: Arc<dyn OntologyService>,
    storage: Arc<dyn StorageService>,
    registry: Arc<ModelRegistry>,
    engine: Arc<InferenceEngine>,
    scenarios: ScenarioManager,
    actions: ActionManager,
    dispatcher: Arc<WorkDispatcher>,
    entity_locks: KeyedLocks<String>,
    /// Serializes writes of one twin record between updates and sync
    twin_locks: KeyedLocks<String>,
    metrics: TwinMetrics,
    logger: StructuredLogger,
}

impl DigitalTwinService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        ontology: Arc<dyn OntologyService>,
        storage: Arc<dyn StorageService>,
        dispatcher: Arc<WorkDispatcher>,
        predictors: PredictorRegistry,
        config: EngineConfig,
        logger: StructuredLogger,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::new(
            store.clone(),
            config.artifact_load_timeout,
        ));
        let engine = Arc::new(InferenceEngine::new(
            registry.clone(),
            predictors,
            PredictionCache::new(store.clone()),
            config,
        ));
        let scenarios = ScenarioManager::new(store.clone(), engine.clone());
        let actions = ActionManager::new(store.clone(), dispatcher.clone(), logger.clone());

        Self {
            store,
            ontology,
            storage,
            registry,
            engine,
            scenarios,
            actions,
            dispatcher,
            entity_locks: KeyedLocks::new(),
            twin_locks: KeyedLocks::new(),
            metrics: TwinMetrics::new(),
            logger,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    // Twin lifecycle

    pub async fn create_twin(&self, request: CreateTwinRequest) -> Result<DigitalTwin> {
        if request.name.trim().is_empty() {
            return Err(TwinError::validation("digital twin name must not be empty"));
        }
        if request.project_id.trim().is_empty() {
            return Err(TwinError::validation("project_id must not be empty"));
        }
        if request.ontology_id.trim().is_empty() {
            return Err(TwinError::validation("ontology_id must not be empty"));
        }

        let ontology = self.ontology.get_ontology(&request.ontology_id).await?;
        if ontology.project_id != request.project_id {
            return Err(TwinError::validation(format!(
                "ontology {} belongs to project {}, not {}",
                ontology.id, ontology.project_id, request.project_id
            )));
        }

        let config = request.config.unwrap_or_default();
        self.validate_config(&config, &request.project_id).await?;

        let now = Utc::now();
        let twin = DigitalTwin {
            id: new_id(),
            name: request.name,
            project_id: request.project_id,
            ontology_id: request.ontology_id,
            config,
            metadata: request.metadata,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_twin(&twin).await?;

        // One-time population from the ontology blueprint
        for blueprint in &ontology.entity_types {
            let entity = Entity::template(&twin.id, &blueprint.name);
            if let Err(e) = self.store.put_entity(&entity).await {
                self.discard_partial_twin(&twin.id).await;
                return Err(e);
            }
        }

        info!(
            twin_id = %twin.id,
            project_id = %twin.project_id,
            entity_templates = ontology.entity_types.len(),
            "Digital twin created"
        );
        Ok(twin)
    }

    /// Remove a twin whose entity templates could not all be written
    async fn discard_partial_twin(&self, twin_id: &str) {
        let cleanup = async {
            self.store.delete_entities_for_twin(twin_id).await?;
            self.store.delete_twin(twin_id).await
        };
        if let Err(e) = cleanup.await {
            warn!(twin_id = %twin_id, error = %e, "Failed to remove partially created twin");
        }
    }

    async fn validate_config(&self, config: &TwinConfig, project_id: &str) -> Result<()> {
        if config.auto_sync && config.sync_interval_secs == 0 {
            return Err(TwinError::validation(
                "sync_interval_secs must be positive when auto_sync is on",
            ));
        }
        if config.sync_interval_secs > MAX_SYNC_INTERVAL_SECS {
            return Err(TwinError::validation(format!(
                "sync_interval_secs must not exceed {MAX_SYNC_INTERVAL_SECS}"
            )));
        }
        if config
            .prediction_cache_ttl_secs
            .is_some_and(|ttl| ttl > MAX_PREDICTION_TTL_SECS)
        {
            return Err(TwinError::validation(format!(
                "prediction_cache_ttl_secs must not exceed {MAX_PREDICTION_TTL_SECS}"
            )));
        }
        for storage_id in &config.storage_ids {
            let storage = self
                .storage
                .get_storage_config(storage_id)
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => {
                        TwinError::validation(format!("unknown storage reference {storage_id}"))
                    }
                    _ => TwinError::dependency(format!("storage service failed: {e}")),
                })?;
            if storage.project_id != project_id {
                return Err(TwinError::validation(format!(
                    "storage {storage_id} belongs to project {}, not {project_id}",
                    storage.project_id
                )));
            }
        }
        Ok(())
    }

    pub async fn get_twin(&self, twin_id: &str) -> Result<DigitalTwin> {
        self.store
            .get_twin(twin_id)
            .await?
            .ok_or_else(|| TwinError::not_found(RecordKind::Twin, twin_id))
    }

    pub async fn list_twins(&self, project_id: Option<&str>) -> Result<Vec<DigitalTwin>> {
        self.store.list_twins(project_id).await
    }

    /// Rename, reconfigure or replace metadata. TTL changes apply to
    /// predictions made afterwards.
    pub async fn update_twin(
        &self,
        twin_id: &str,
        request: UpdateTwinRequest,
    ) -> Result<DigitalTwin> {
        let _guard = self.twin_locks.lock(twin_id.to_string()).await;
        let mut twin = self.get_twin(twin_id).await?;

        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(TwinError::validation("digital twin name must not be empty"));
            }
            twin.name = name;
        }
        if let Some(config) = request.config {
            self.validate_config(&config, &twin.project_id).await?;
            twin.config = config;
        }
        if let Some(metadata) = request.metadata {
            twin.metadata = metadata;
        }
        twin.updated_at = Utc::now();
        self.store.put_twin(&twin).await?;

        info!(twin_id = %twin.id, "Digital twin updated");
        Ok(twin)
    }

    /// Delete a twin with its entities, predictions, scenarios and actions
    pub async fn delete_twin(&self, twin_id: &str) -> Result<()> {
        self.get_twin(twin_id).await?;

        let actions = self.store.delete_actions_for_twin(twin_id).await?;
        let scenarios = self.store.delete_scenarios_for_twin(twin_id).await?;
        let predictions = self.store.delete_predictions_for_twin(twin_id).await?;
        let entities = self.store.delete_entities_for_twin(twin_id).await?;
        self.store.delete_twin(twin_id).await?;

        info!(
            twin_id = %twin_id,
            entities,
            predictions,
            scenarios,
            actions,
            "Digital twin deleted"
        );
        Ok(())
    }

    // Entities

    pub async fn get_entity(&self, twin_id: &str, entity_id: &str) -> Result<Entity> {
        self.store
            .get_entity(entity_id)
            .await?
            .filter(|e| e.twin_id == twin_id)
            .ok_or_else(|| TwinError::not_found(RecordKind::Entity, entity_id))
    }

    pub async fn list_entities(&self, twin_id: &str) -> Result<Vec<Entity>> {
        self.get_twin(twin_id).await?;
        self.store.list_entities(twin_id).await
    }

    /// Merge user deltas into an entity and invalidate its cached predictions.
    ///
    /// Fails if the invalidation cannot be persisted, even though the entity
    /// itself was written.
    pub async fn update_entity(
        &self,
        twin_id: &str,
        entity_id: &str,
        deltas: AttributeMap,
    ) -> Result<Entity> {
        if deltas.is_empty() {
            return Err(TwinError::validation("entity update carries no attributes"));
        }
        self.get_twin(twin_id).await?;

        let entity = {
            let _guard = self.entity_locks.lock(entity_id.to_string()).await;
            let mut entity = self.get_entity(twin_id, entity_id).await?;
            entity.apply_modifications(&deltas);
            self.store.put_entity(&entity).await?;
            entity
        };

        self.invalidate_entity(entity_id).await?;

        info!(
            twin_id = %twin_id,
            entity_id = %entity_id,
            changed = deltas.len(),
            "Entity updated"
        );
        Ok(entity)
    }

    async fn invalidate_entity(&self, entity_id: &str) -> Result<usize> {
        self.engine
            .cache()
            .invalidate_entity(entity_id)
            .await
            .map_err(|e| {
                TwinError::dependency(format!(
                    "cached predictions of entity {entity_id} could not be invalidated: {e}"
                ))
            })
    }

    // Synchronization

    /// Pull authoritative records from every configured storage and rebase
    /// bound entities on them. User modifications always survive.
    pub async fn sync_with_storage(&self, twin_id: &str) -> Result<SyncReport> {
        let twin = self.get_twin(twin_id).await?;

        match self.sync_entities(&twin).await {
            Ok(report) => {
                self.stamp_synced(twin_id, report.synced_at).await?;

                self.metrics.inc_syncs_completed();
                self.logger.log_sync(
                    twin_id,
                    report.records,
                    report.entities_created,
                    true,
                );
                Ok(report)
            }
            Err(e) => {
                self.logger.log_sync(twin_id, 0, 0, false);
                Err(e)
            }
        }
    }

    /// Record a finished sync on the current twin record. Config changes
    /// made while the sync ran are kept.
    async fn stamp_synced(&self, twin_id: &str, synced_at: DateTime<Utc>) -> Result<()> {
        let _guard = self.twin_locks.lock(twin_id.to_string()).await;
        let mut twin = self.get_twin(twin_id).await?;
        twin.last_sync_at = Some(synced_at);
        twin.updated_at = synced_at;
        self.store.put_twin(&twin).await
    }

    async fn sync_entities(&self, twin: &DigitalTwin) -> Result<SyncReport> {
        let mut entities = self.store.list_entities(&twin.id).await?;
        let mut report = SyncReport {
            twin_id: twin.id.clone(),
            records: 0,
            entities_created: 0,
            entities_updated: 0,
            synced_at: Utc::now(),
        };

        for storage_id in &twin.config.storage_ids {
            let records = self.fetch_storage(storage_id).await?;
            for record in records {
                report.records += 1;

                let bound = entities
                    .iter()
                    .position(|e| e.source_record_id.as_deref() == Some(record.id.as_str()));
                let template = || {
                    entities.iter().position(|e| {
                        e.source_record_id.is_none() && e.entity_type == record.entity_type
                    })
                };

                match bound.or_else(template) {
                    Some(index) => {
                        let entity_id = entities[index].id.clone();
                        let entity = self.rebase_entity(&twin.id, &entity_id, &record).await?;
                        entities[index] = entity;
                        report.entities_updated += 1;
                    }
                    None => {
                        let mut entity = Entity::template(&twin.id, &record.entity_type);
                        entity.source_record_id = Some(record.id.clone());
                        entity.rebase(&record.values);
                        self.store.put_entity(&entity).await?;
                        entities.push(entity);
                        report.entities_created += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn fetch_storage(&self, storage_id: &str) -> Result<Vec<SourceRecord>> {
        self.storage
            .get_storage_config(storage_id)
            .await
            .map_err(|e| TwinError::dependency(format!("storage {storage_id}: {e}")))?;
        self.storage
            .fetch_records(storage_id)
            .await
            .map_err(|e| TwinError::dependency(format!("storage {storage_id}: {e}")))
    }

    /// Bind `entity_id` to `record` and re-derive its attributes
    async fn rebase_entity(
        &self,
        twin_id: &str,
        entity_id: &str,
        record: &SourceRecord,
    ) -> Result<Entity> {
        let (entity, changed) = {
            let _guard = self.entity_locks.lock(entity_id.to_string()).await;
            let mut entity = self.get_entity(twin_id, entity_id).await?;
            let before = entity.attributes.clone();
            entity.source_record_id = Some(record.id.clone());
            entity.rebase(&record.values);
            self.store.put_entity(&entity).await?;
            let changed = entity.attributes != before;
            (entity, changed)
        };

        if changed {
            self.invalidate_entity(entity_id).await?;
        }
        Ok(entity)
    }

    /// Twins with auto-sync on whose interval has elapsed at `now`
    pub async fn twins_due_for_sync(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let twins = self.store.list_twins(None).await?;
        Ok(twins
            .into_iter()
            .filter(|t| t.config.auto_sync)
            .filter(|t| match t.last_sync_at {
                None => true,
                Some(last) => now.signed_duration_since(last) >= t.config.sync_interval(),
            })
            .map(|t| t.id)
            .collect())
    }

    // Predictions

    /// Point prediction followed by action evaluation on fresh results.
    ///
    /// Cache hits never re-evaluate actions.
    pub async fn predict(
        &self,
        twin_id: &str,
        request: PredictionRequest,
    ) -> Result<PredictionResponse> {
        let twin = self.get_twin(twin_id).await?;
        ensure_predictions_enabled(&twin)?;

        // Epoch first: an update landing after this read invalidates the result
        let (entity, observed) = match request.entity_id.as_deref() {
            Some(entity_id) => {
                let observed = self.engine.cache().entity_epoch(entity_id);
                (Some(self.get_entity(twin_id, entity_id).await?), Some(observed))
            }
            None => (None, None),
        };

        let outcome = self
            .engine
            .predict(&twin, &request, entity.as_ref(), observed)
            .await?;
        let prediction = outcome.prediction;
        self.logger.log_prediction(
            twin_id,
            &prediction.model_id,
            prediction.entity_id.as_deref(),
            &prediction.id,
            prediction.confidence,
            outcome.from_cache,
        );

        let triggered_tasks = if outcome.from_cache {
            Vec::new()
        } else {
            match self.actions.evaluate_actions(twin_id, &prediction).await {
                Ok(task_ids) => task_ids,
                Err(e) => {
                    warn!(
                        twin_id = %twin_id,
                        prediction_id = %prediction.id,
                        error = %e,
                        "Action evaluation failed"
                    );
                    Vec::new()
                }
            }
        };

        Ok(PredictionResponse {
            prediction,
            from_cache: outcome.from_cache,
            triggered_tasks,
        })
    }

    pub async fn batch_predict(
        &self,
        twin_id: &str,
        request: BatchPredictionRequest,
    ) -> Result<Vec<Prediction>> {
        let twin = self.get_twin(twin_id).await?;
        self.engine.batch_predict(&twin, &request).await
    }

    pub async fn list_predictions(&self, twin_id: &str) -> Result<Vec<Prediction>> {
        self.get_twin(twin_id).await?;
        self.store.list_predictions(twin_id).await
    }

    /// Drop expired predictions and idle entity and twin locks
    pub async fn sweep_expired_predictions(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.engine.cache().sweep(now).await?;
        self.entity_locks.prune_idle();
        self.twin_locks.prune_idle();
        Ok(removed)
    }

    // Scenarios

    pub async fn create_scenario(
        &self,
        twin_id: &str,
        request: CreateScenarioRequest,
    ) -> Result<Scenario> {
        let twin = self.get_twin(twin_id).await?;
        self.scenarios.create_scenario(&twin, request).await
    }

    pub async fn get_scenario(&self, twin_id: &str, scenario_id: &str) -> Result<Scenario> {
        self.get_twin(twin_id).await?;
        self.scenarios.get_scenario(twin_id, scenario_id).await
    }

    pub async fn list_scenarios(&self, twin_id: &str) -> Result<Vec<Scenario>> {
        self.get_twin(twin_id).await?;
        self.scenarios.list_scenarios(twin_id).await
    }

    pub async fn delete_scenario(&self, twin_id: &str, scenario_id: &str) -> Result<()> {
        self.get_twin(twin_id).await?;
        self.scenarios.delete_scenario(twin_id, scenario_id).await
    }

    // Actions

    pub async fn create_action(
        &self,
        twin_id: &str,
        request: CreateActionRequest,
    ) -> Result<Action> {
        let twin = self.get_twin(twin_id).await?;
        self.actions.create_action(&twin, request).await
    }

    pub async fn get_action(&self, twin_id: &str, action_id: &str) -> Result<Action> {
        self.get_twin(twin_id).await?;
        self.actions.get_action(twin_id, action_id).await
    }

    pub async fn list_actions(&self, twin_id: &str) -> Result<Vec<Action>> {
        self.get_twin(twin_id).await?;
        self.actions.list_actions(twin_id).await
    }

    pub async fn delete_action(&self, twin_id: &str, action_id: &str) -> Result<()> {
        self.get_twin(twin_id).await?;
        self.actions.delete_action(twin_id, action_id).await
    }
}
