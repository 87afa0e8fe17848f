//! End-to-end tests of the twin control loop: entity state, cached
//! inference, scenarios, actions and the dispatcher working together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

use twin_core::action::Operator;
use twin_core::collaborators::{
    EntityTypeBlueprint, Ontology, SourceRecord, StaticOntologyService, StaticStorageService,
    StorageConfig, StorageService,
};
use twin_core::dispatch::WorkDispatcher;
use twin_core::inference::{EngineConfig, PredictorRegistry};
use twin_core::store::{InMemoryMetadataStore, MetadataStore};
use twin_core::twin::{MaintenanceConfig, MaintenanceScheduler};
use twin_core::*;

/// Store wrapper that can be told to fail specific operations
#[derive(Default)]
struct FaultyStore {
    inner: InMemoryMetadataStore,
    fail_invalidation: AtomicBool,
    fail_action_lookup: Mutex<Option<String>>,
    fail_twin_listing: AtomicBool,
    fail_entity_writes: AtomicBool,
    /// Holds every model lookup this long
    model_delay_ms: AtomicU64,
}

/// Storage service whose record fetches can be slowed down
#[derive(Default)]
struct SlowStorage {
    inner: StaticStorageService,
    fetch_delay_ms: AtomicU64,
}

#[async_trait]
impl StorageService for SlowStorage {
    async fn get_storage_config(&self, id: &str) -> Result<StorageConfig> {
        self.inner.get_storage_config(id).await
    }
    async fn fetch_records(&self, id: &str) -> Result<Vec<SourceRecord>> {
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.inner.fetch_records(id).await
    }
}

#[async_trait]
impl MetadataStore for FaultyStore {
    async fn put_twin(&self, twin: &DigitalTwin) -> Result<()> {
        self.inner.put_twin(twin).await
    }
    async fn get_twin(&self, id: &str) -> Result<Option<DigitalTwin>> {
        self.inner.get_twin(id).await
    }
    async fn list_twins(&self, project_id: Option<&str>) -> Result<Vec<DigitalTwin>> {
        if self.fail_twin_listing.load(Ordering::SeqCst) {
            return Err(TwinError::dependency("twin table unavailable"));
        }
        self.inner.list_twins(project_id).await
    }
    async fn delete_twin(&self, id: &str) -> Result<bool> {
        self.inner.delete_twin(id).await
    }
    async fn put_entity(&self, entity: &Entity) -> Result<()> {
        if self.fail_entity_writes.load(Ordering::SeqCst) {
            return Err(TwinError::dependency("entity table unavailable"));
        }
        self.inner.put_entity(entity).await
    }
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.inner.get_entity(id).await
    }
    async fn list_entities(&self, twin_id: &str) -> Result<Vec<Entity>> {
        self.inner.list_entities(twin_id).await
    }
    async fn delete_entities_for_twin(&self, twin_id: &str) -> Result<usize> {
        self.inner.delete_entities_for_twin(twin_id).await
    }
    async fn put_model(&self, model: &MlModel) -> Result<()> {
        self.inner.put_model(model).await
    }
    async fn get_model(&self, id: &str) -> Result<Option<MlModel>> {
        let delay = self.model_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.inner.get_model(id).await
    }
    async fn list_models(&self, project_id: Option<&str>) -> Result<Vec<MlModel>> {
        self.inner.list_models(project_id).await
    }
    async fn delete_model(&self, id: &str) -> Result<bool> {
        self.inner.delete_model(id).await
    }
    async fn put_prediction(&self, prediction: &Prediction) -> Result<()> {
        self.inner.put_prediction(prediction).await
    }
    async fn get_prediction(&self, id: &str) -> Result<Option<Prediction>> {
        self.inner.get_prediction(id).await
    }
    async fn list_predictions(&self, twin_id: &str) -> Result<Vec<Prediction>> {
        self.inner.list_predictions(twin_id).await
    }
    async fn delete_prediction(&self, id: &str) -> Result<bool> {
        self.inner.delete_prediction(id).await
    }
    async fn find_cached_prediction(
        &self,
        twin_id: &str,
        model_id: &str,
        entity_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Prediction>> {
        self.inner
            .find_cached_prediction(twin_id, model_id, entity_id, now)
            .await
    }
    async fn delete_predictions_for_entity(&self, entity_id: &str) -> Result<usize> {
        if self.fail_invalidation.load(Ordering::SeqCst) {
            return Err(TwinError::dependency("prediction table unavailable"));
        }
        self.inner.delete_predictions_for_entity(entity_id).await
    }
    async fn delete_predictions_for_twin(&self, twin_id: &str) -> Result<usize> {
        self.inner.delete_predictions_for_twin(twin_id).await
    }
    async fn delete_expired_predictions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_expired_predictions(now).await
    }
    async fn put_scenario(&self, scenario: &Scenario) -> Result<()> {
        self.inner.put_scenario(scenario).await
    }
    async fn get_scenario(&self, id: &str) -> Result<Option<Scenario>> {
        self.inner.get_scenario(id).await
    }
    async fn list_scenarios(&self, twin_id: &str) -> Result<Vec<Scenario>> {
        self.inner.list_scenarios(twin_id).await
    }
    async fn delete_scenario(&self, id: &str) -> Result<bool> {
        self.inner.delete_scenario(id).await
    }
    async fn delete_scenarios_for_twin(&self, twin_id: &str) -> Result<usize> {
        self.inner.delete_scenarios_for_twin(twin_id).await
    }
    async fn put_action(&self, action: &Action) -> Result<()> {
        self.inner.put_action(action).await
    }
    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        let failing = self.fail_action_lookup.lock().unwrap().clone();
        if failing.as_deref() == Some(id) {
            return Err(TwinError::dependency("action table unavailable"));
        }
        self.inner.get_action(id).await
    }
    async fn list_actions(&self, twin_id: &str) -> Result<Vec<Action>> {
        self.inner.list_actions(twin_id).await
    }
    async fn delete_action(&self, id: &str) -> Result<bool> {
        self.inner.delete_action(id).await
    }
    async fn delete_actions_for_twin(&self, twin_id: &str) -> Result<usize> {
        self.inner.delete_actions_for_twin(twin_id).await
    }
}

struct Harness {
    service: Arc<DigitalTwinService>,
    store: Arc<FaultyStore>,
    storage: Arc<SlowStorage>,
    _artifacts: Vec<NamedTempFile>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(FaultyStore::default());
        let ontology = Arc::new(StaticOntologyService::new());
        ontology.insert(Ontology {
            id: "onto-1".into(),
            project_id: "proj-1".into(),
            entity_types: vec![
                EntityTypeBlueprint {
                    name: "pump".into(),
                    attributes: vec!["x".into()],
                },
                EntityTypeBlueprint {
                    name: "valve".into(),
                    attributes: vec!["x".into()],
                },
            ],
        });
        ontology.insert(Ontology {
            id: "onto-foreign".into(),
            project_id: "proj-2".into(),
            entity_types: vec![],
        });

        let storage = Arc::new(SlowStorage::default());
        storage.inner.insert(
            StorageConfig {
                id: "s1".into(),
                project_id: "proj-1".into(),
                kind: "postgres".into(),
            },
            vec![],
        );

        let service = Arc::new(DigitalTwinService::new(
            store.clone(),
            ontology,
            storage.clone(),
            Arc::new(WorkDispatcher::new()),
            PredictorRegistry::with_defaults(),
            EngineConfig::default(),
            StructuredLogger::new("control-loop-test"),
        ));

        Self {
            service,
            store,
            storage,
            _artifacts: Vec::new(),
        }
    }

    async fn twin(&self, config: TwinConfig) -> DigitalTwin {
        self.service
            .create_twin(CreateTwinRequest {
                name: "plant".into(),
                project_id: "proj-1".into(),
                ontology_id: "onto-1".into(),
                config: Some(config),
                metadata: AttributeMap::new(),
            })
            .await
            .unwrap()
    }

    async fn trained_model(&mut self, artifact: Value) -> String {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(artifact.to_string().as_bytes()).unwrap();

        let registry = self.service.registry();
        let model = registry
            .register(RegisterModelRequest {
                project_id: "proj-1".into(),
                name: "forecast".into(),
                model_type: artifact["model_type"].as_str().unwrap().into(),
            })
            .await
            .unwrap();
        registry
            .apply_status_update(&model.id, status_update(ModelStatus::Training, None))
            .await
            .unwrap();
        registry
            .apply_status_update(
                &model.id,
                status_update(
                    ModelStatus::Trained,
                    Some(file.path().display().to_string()),
                ),
            )
            .await
            .unwrap();

        self._artifacts.push(file);
        model.id
    }

    async fn regression_model(&mut self) -> String {
        self.trained_model(json!({
            "model_type": "regression",
            "feature_names": ["x"],
            "parameters": {"weights": [2.0], "intercept": 1.0}
        }))
        .await
    }

    async fn entity_of_type(&self, twin_id: &str, entity_type: &str) -> Entity {
        self.service
            .list_entities(twin_id)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.entity_type == entity_type)
            .unwrap()
    }
}

fn status_update(status: ModelStatus, artifact_path: Option<String>) -> ModelStatusUpdate {
    ModelStatusUpdate {
        status,
        artifact_path,
        metrics: None,
        error: None,
    }
}

fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn predict_request(model_id: &str, entity_id: &str, input: AttributeMap) -> PredictionRequest {
    PredictionRequest {
        model_id: model_id.into(),
        entity_id: Some(entity_id.into()),
        input,
        use_cache: true,
    }
}

fn action_request(model_id: &str, operator: Operator, threshold: f64, enabled: bool) -> CreateActionRequest {
    CreateActionRequest {
        name: "dispatch retrain".into(),
        enabled,
        condition: Condition {
            model_id: model_id.into(),
            operator,
            threshold,
        },
        trigger: Trigger {
            pipeline_id: "pipeline-7".into(),
            parameters: attrs(&[("mode", json!("fast"))]),
        },
    }
}

#[tokio::test]
async fn test_end_to_end_predict_cache_and_fire_once() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let entity = h.entity_of_type(&twin.id, "pump").await;
    let action = h
        .service
        .create_action(&twin.id, action_request(&model_id, Operator::GreaterOrEqual, 5.0, true))
        .await
        .unwrap();

    let request = predict_request(&model_id, &entity.id, attrs(&[("x", json!(3.0))]));
    let first = h.service.predict(&twin.id, request.clone()).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.prediction.output, json!(7.0));
    assert_eq!(first.prediction.confidence, 1.0);
    assert_eq!(first.triggered_tasks.len(), 1);

    let second = h.service.predict(&twin.id, request).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.prediction.id, first.prediction.id);
    assert_eq!(second.prediction.expires_at, first.prediction.expires_at);
    assert!(second.prediction.expires_at > Utc::now());
    assert!(second.triggered_tasks.is_empty());

    let dispatcher = h.service.dispatcher();
    assert_eq!(dispatcher.len().unwrap(), 1);
    let task = dispatcher.dequeue().unwrap().unwrap();
    assert_eq!(task.id, first.triggered_tasks[0]);
    assert_eq!(task.task_type, TASK_TYPE_PIPELINE_EXECUTION);
    assert_eq!(task.priority, 8);
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.spec["pipeline_id"], json!("pipeline-7"));
    assert_eq!(task.spec["parameters"]["mode"], json!("fast"));

    let action = h.service.get_action(&twin.id, &action.id).await.unwrap();
    assert_eq!(action.trigger_count, 1);
    assert!(action.last_triggered_at.is_some());
}

#[tokio::test]
async fn test_sync_never_drops_user_overrides() {
    let h = Harness::new();
    let twin = h
        .twin(TwinConfig {
            storage_ids: vec!["s1".into()],
            ..Default::default()
        })
        .await;

    h.storage
        .inner
        .set_records(
            "s1",
            vec![SourceRecord {
                id: "r1".into(),
                entity_type: "pump".into(),
                values: attrs(&[("rpm", json!(900)), ("temp", json!(40))]),
            }],
        )
        .unwrap();

    let report = h.service.sync_with_storage(&twin.id).await.unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(report.entities_updated, 1);
    assert_eq!(report.entities_created, 0);

    let pump = h.entity_of_type(&twin.id, "pump").await;
    assert_eq!(pump.source_record_id.as_deref(), Some("r1"));
    assert_eq!(pump.attributes, attrs(&[("rpm", json!(900)), ("temp", json!(40))]));

    let updated = h
        .service
        .update_entity(&twin.id, &pump.id, attrs(&[("rpm", json!(1200))]))
        .await
        .unwrap();
    assert!(updated.is_modified);
    assert_eq!(updated.attributes["rpm"], json!(1200));

    let fresh_source = attrs(&[("rpm", json!(950)), ("temp", json!(41)), ("vibration", json!(0.2))]);
    h.storage
        .inner
        .set_records(
            "s1",
            vec![
                SourceRecord {
                    id: "r1".into(),
                    entity_type: "pump".into(),
                    values: fresh_source.clone(),
                },
                SourceRecord {
                    id: "r2".into(),
                    entity_type: "pump".into(),
                    values: attrs(&[("rpm", json!(700))]),
                },
            ],
        )
        .unwrap();
    let report = h.service.sync_with_storage(&twin.id).await.unwrap();
    assert_eq!(report.entities_updated, 1);
    assert_eq!(report.entities_created, 1);

    let pump = h.service.get_entity(&twin.id, &pump.id).await.unwrap();
    let mut expected = fresh_source;
    for (k, v) in &pump.modifications {
        expected.insert(k.clone(), v.clone());
    }
    assert_eq!(pump.attributes, expected);
    assert_eq!(pump.attributes["rpm"], json!(1200));
    assert_eq!(pump.modifications, attrs(&[("rpm", json!(1200))]));

    let twin = h.service.get_twin(&twin.id).await.unwrap();
    assert!(twin.last_sync_at.is_some());
}

#[tokio::test]
async fn test_entity_update_invalidates_only_that_entity() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    let valve = h.entity_of_type(&twin.id, "valve").await;

    let pump_req = predict_request(&model_id, &pump.id, AttributeMap::new());
    let valve_req = predict_request(&model_id, &valve.id, AttributeMap::new());
    let pump_first = h.service.predict(&twin.id, pump_req.clone()).await.unwrap();
    let valve_first = h.service.predict(&twin.id, valve_req.clone()).await.unwrap();

    h.service
        .update_entity(&twin.id, &pump.id, attrs(&[("x", json!(4.0))]))
        .await
        .unwrap();

    let pump_second = h.service.predict(&twin.id, pump_req).await.unwrap();
    assert!(!pump_second.from_cache);
    assert_ne!(pump_second.prediction.id, pump_first.prediction.id);
    assert_eq!(pump_second.prediction.output, json!(9.0));

    let valve_second = h.service.predict(&twin.id, valve_req).await.unwrap();
    assert!(valve_second.from_cache);
    assert_eq!(valve_second.prediction.id, valve_first.prediction.id);
}

#[tokio::test]
async fn test_expired_prediction_is_not_reused() {
    let mut h = Harness::new();
    let twin = h
        .twin(TwinConfig {
            prediction_cache_ttl_secs: Some(1),
            ..Default::default()
        })
        .await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    let request = predict_request(&model_id, &pump.id, AttributeMap::new());

    let first = h.service.predict(&twin.id, request.clone()).await.unwrap();
    assert_eq!(
        first.prediction.expires_at - first.prediction.cached_at,
        chrono::Duration::seconds(1)
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = h.service.predict(&twin.id, request).await.unwrap();
    assert!(!second.from_cache);
    assert_ne!(second.prediction.id, first.prediction.id);

    let swept = h
        .service
        .sweep_expired_predictions(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(swept, 2);
}

#[tokio::test]
async fn test_disabled_predictions_reject_entry_points() {
    let mut h = Harness::new();
    let twin = h
        .twin(TwinConfig {
            enable_predictions: false,
            ..Default::default()
        })
        .await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;

    let err = h
        .service
        .predict(&twin.id, predict_request(&model_id, &pump.id, AttributeMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);

    let err = h
        .service
        .create_action(&twin.id, action_request(&model_id, Operator::Greater, 1.0, true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);

    let err = h
        .service
        .batch_predict(
            &twin.id,
            BatchPredictionRequest {
                model_id,
                inputs: vec![AttributeMap::new()],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_disabled_action_never_enqueues() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .create_action(&twin.id, action_request(&model_id, Operator::Greater, -1e9, false))
        .await
        .unwrap();

    for x in [0.0, 1e6, -1e6] {
        let mut request = predict_request(&model_id, &pump.id, attrs(&[("x", json!(x))]));
        request.use_cache = false;
        let response = h.service.predict(&twin.id, request).await.unwrap();
        assert!(response.triggered_tasks.is_empty());
    }
    assert!(h.service.dispatcher().is_empty().unwrap());
}

#[tokio::test]
async fn test_scenario_leaves_entities_untouched() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .update_entity(&twin.id, &pump.id, attrs(&[("x", json!(1.0))]))
        .await
        .unwrap();

    let before = serde_json::to_vec(&h.service.list_entities(&twin.id).await.unwrap()).unwrap();

    let scenario = h
        .service
        .create_scenario(
            &twin.id,
            CreateScenarioRequest {
                name: "double load".into(),
                description: None,
                base_state: None,
                modifications: vec![ScenarioModification {
                    entity_id: pump.id.clone(),
                    attribute: "x".into(),
                    value: json!(10.0),
                }],
                model_ids: vec![model_id.clone()],
                run_predictions: true,
            },
        )
        .await
        .unwrap();

    let after = serde_json::to_vec(&h.service.list_entities(&twin.id).await.unwrap()).unwrap();
    assert_eq!(before, after);

    assert_eq!(scenario.status, ScenarioStatus::Completed);
    assert_eq!(scenario.base_state, DEFAULT_BASE_STATE);
    let pump_run = scenario
        .predictions
        .iter()
        .find(|p| p.entity_id == pump.id)
        .unwrap();
    assert_eq!(pump_run.output, json!(21.0));
    assert_eq!(pump_run.baseline_output, Some(json!(3.0)));

    // Scenario runs never populate the live cache
    assert!(h.service.list_predictions(&twin.id).await.unwrap().is_empty());
    assert!(h.service.dispatcher().is_empty().unwrap());

    let stored = h.service.get_scenario(&twin.id, &scenario.id).await.unwrap();
    assert_eq!(stored.predictions.len(), scenario.predictions.len());
}

#[tokio::test]
async fn test_failed_invalidation_fails_the_update() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .predict(&twin.id, predict_request(&model_id, &pump.id, AttributeMap::new()))
        .await
        .unwrap();

    h.store.fail_invalidation.store(true, Ordering::SeqCst);
    let err = h
        .service
        .update_entity(&twin.id, &pump.id, attrs(&[("x", json!(2.0))]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);
}

#[tokio::test]
async fn test_one_failing_action_does_not_block_others() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;

    let broken = h
        .service
        .create_action(&twin.id, action_request(&model_id, Operator::GreaterOrEqual, 0.0, true))
        .await
        .unwrap();
    let healthy = h
        .service
        .create_action(&twin.id, action_request(&model_id, Operator::GreaterOrEqual, 0.0, true))
        .await
        .unwrap();
    *h.store.fail_action_lookup.lock().unwrap() = Some(broken.id.clone());

    let response = h
        .service
        .predict(&twin.id, predict_request(&model_id, &pump.id, AttributeMap::new()))
        .await
        .unwrap();
    assert_eq!(response.triggered_tasks.len(), 1);
    // The failing action's task was already enqueued before its record update failed
    assert_eq!(h.service.dispatcher().len().unwrap(), 2);

    *h.store.fail_action_lookup.lock().unwrap() = None;
    let healthy = h.service.get_action(&twin.id, &healthy.id).await.unwrap();
    assert_eq!(healthy.trigger_count, 1);
    let broken = h.service.get_action(&twin.id, &broken.id).await.unwrap();
    assert_eq!(broken.trigger_count, 0);
}

#[tokio::test]
async fn test_delete_twin_cascades() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .predict(&twin.id, predict_request(&model_id, &pump.id, AttributeMap::new()))
        .await
        .unwrap();
    h.service
        .create_action(&twin.id, action_request(&model_id, Operator::Less, 0.0, true))
        .await
        .unwrap();

    h.service.delete_twin(&twin.id).await.unwrap();

    let err = h.service.get_twin(&twin.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.store.list_entities(&twin.id).await.unwrap().is_empty());
    assert!(h.store.list_predictions(&twin.id).await.unwrap().is_empty());
    assert!(h.store.list_actions(&twin.id).await.unwrap().is_empty());
    assert!(h.store.list_scenarios(&twin.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_twin_validation() {
    let h = Harness::new();
    let err = h
        .service
        .create_twin(CreateTwinRequest {
            name: "plant".into(),
            project_id: "proj-1".into(),
            ontology_id: "onto-foreign".into(),
            config: None,
            metadata: AttributeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .service
        .create_twin(CreateTwinRequest {
            name: "plant".into(),
            project_id: "proj-1".into(),
            ontology_id: "onto-1".into(),
            config: Some(TwinConfig {
                storage_ids: vec!["missing".into()],
                ..Default::default()
            }),
            metadata: AttributeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let twin = h.twin(TwinConfig::default()).await;
    assert_eq!(twin.config.prediction_ttl(), chrono::Duration::seconds(1800));
    assert_eq!(h.service.list_entities(&twin.id).await.unwrap().len(), 2);
    assert!(h
        .service
        .list_entities(&twin.id)
        .await
        .unwrap()
        .iter()
        .all(|e| e.attributes.is_empty() && e.source_record_id.is_none()));
}

#[tokio::test]
async fn test_placeholder_model_flows_through_actions() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h
        .trained_model(json!({
            "model_type": "decision_tree",
            "feature_names": ["x"],
            "parameters": {"default_prediction": 11}
        }))
        .await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .create_action(&twin.id, action_request(&model_id, Operator::Greater, 10.0, true))
        .await
        .unwrap();

    let response = h
        .service
        .predict(&twin.id, predict_request(&model_id, &pump.id, AttributeMap::new()))
        .await
        .unwrap();
    assert_eq!(response.prediction.output, json!(11));
    assert_eq!(response.prediction.confidence, 0.85);
    assert_eq!(response.triggered_tasks.len(), 1);
}

#[tokio::test]
async fn test_update_during_inference_is_not_served_stale() {
    let mut h = Harness::new();
    let twin = h.twin(TwinConfig::default()).await;
    let model_id = h.regression_model().await;
    let pump = h.entity_of_type(&twin.id, "pump").await;
    h.service
        .update_entity(&twin.id, &pump.id, attrs(&[("x", json!(3.0))]))
        .await
        .unwrap();

    let request = predict_request(&model_id, &pump.id, AttributeMap::new());
    h.store.model_delay_ms.store(300, Ordering::SeqCst);
    let (in_flight, updated) = tokio::join!(h.service.predict(&twin.id, request.clone()), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.service
            .update_entity(&twin.id, &pump.id, attrs(&[("x", json!(10.0))]))
            .await
    });
    h.store.model_delay_ms.store(0, Ordering::SeqCst);

    // Computed from the attributes read before the update
    let in_flight = in_flight.unwrap();
    assert_eq!(in_flight.prediction.output, json!(7.0));
    assert_eq!(updated.unwrap().attributes["x"], json!(10.0));
    assert!(h
        .store
        .get_prediction(&in_flight.prediction.id)
        .await
        .unwrap()
        .is_none());

    let after = h.service.predict(&twin.id, request).await.unwrap();
    assert!(!after.from_cache);
    assert_eq!(after.prediction.output, json!(21.0));
    assert_eq!(h.service.list_predictions(&twin.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_out_of_range_durations_are_rejected() {
    let h = Harness::new();
    let configs = [
        TwinConfig {
            prediction_cache_ttl_secs: Some(10_000_000_000_000),
            ..Default::default()
        },
        TwinConfig {
            prediction_cache_ttl_secs: Some(u64::MAX),
            ..Default::default()
        },
        TwinConfig {
            auto_sync: true,
            sync_interval_secs: u64::MAX / 2,
            ..Default::default()
        },
    ];
    for config in configs {
        let err = h
            .service
            .create_twin(CreateTwinRequest {
                name: "plant".into(),
                project_id: "proj-1".into(),
                ontology_id: "onto-1".into(),
                config: Some(config),
                metadata: AttributeMap::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    let twin = h.twin(TwinConfig::default()).await;
    let err = h
        .service
        .update_twin(
            &twin.id,
            UpdateTwinRequest {
                name: None,
                config: Some(TwinConfig {
                    prediction_cache_ttl_secs: Some(MAX_PREDICTION_TTL_SECS + 1),
                    ..Default::default()
                }),
                metadata: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let at_limit = h
        .twin(TwinConfig {
            prediction_cache_ttl_secs: Some(MAX_PREDICTION_TTL_SECS),
            auto_sync: true,
            sync_interval_secs: MAX_SYNC_INTERVAL_SECS,
            ..Default::default()
        })
        .await;
    assert_eq!(
        at_limit.config.prediction_ttl(),
        chrono::Duration::seconds(MAX_PREDICTION_TTL_SECS as i64)
    );
}

#[tokio::test]
async fn test_sync_keeps_config_changed_while_running() {
    let h = Harness::new();
    let config = TwinConfig {
        storage_ids: vec!["s1".into()],
        ..Default::default()
    };
    let twin = h.twin(config.clone()).await;

    h.storage.fetch_delay_ms.store(300, Ordering::SeqCst);
    let (synced, updated) = tokio::join!(h.service.sync_with_storage(&twin.id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.service
            .update_twin(
                &twin.id,
                UpdateTwinRequest {
                    name: Some("plant-disabled".into()),
                    config: Some(TwinConfig {
                        enable_predictions: false,
                        ..config.clone()
                    }),
                    metadata: None,
                },
            )
            .await
    });
    synced.unwrap();
    assert!(!updated.unwrap().config.enable_predictions);

    let twin = h.service.get_twin(&twin.id).await.unwrap();
    assert!(!twin.config.enable_predictions);
    assert_eq!(twin.name, "plant-disabled");
    assert!(twin.last_sync_at.is_some());
}

#[tokio::test]
async fn test_store_failure_stays_visible_in_health() {
    let h = Harness::new();
    let health = HealthRegistry::new();
    let scheduler = MaintenanceScheduler::new(
        h.service.clone(),
        MaintenanceConfig::default(),
        health.clone(),
    );

    h.store.fail_twin_listing.store(true, Ordering::SeqCst);
    scheduler.run_once().await;
    let report = health.health().await;
    assert_eq!(report.status, ComponentStatus::Unhealthy);
    assert_eq!(
        report.components["metadata_store"].message.as_deref(),
        Some("dependency failure: twin table unavailable")
    );

    h.store.fail_twin_listing.store(false, Ordering::SeqCst);
    scheduler.run_once().await;
    let report = health.health().await;
    assert_eq!(
        report.components["metadata_store"].status,
        ComponentStatus::Healthy
    );
}

#[tokio::test]
async fn test_failed_template_seeding_leaves_no_twin() {
    let h = Harness::new();
    h.store.fail_entity_writes.store(true, Ordering::SeqCst);

    let err = h
        .service
        .create_twin(CreateTwinRequest {
            name: "plant".into(),
            project_id: "proj-1".into(),
            ontology_id: "onto-1".into(),
            config: None,
            metadata: AttributeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);

    h.store.fail_entity_writes.store(false, Ordering::SeqCst);
    assert!(h.service.list_twins(Some("proj-1")).await.unwrap().is_empty());
}
