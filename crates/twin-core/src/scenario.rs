//! What-if scenarios
//!
//! A scenario overlays attribute overrides on the twin's entities and runs
//! inference against the rendered view. Entity records are never written;
//! the overlay only exists while the scenario's prediction run is in
//! progress.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{RecordKind, Result, TwinError};
use crate::inference::{ensure_predictions_enabled, InferenceEngine};
use crate::models::{
    new_id, AttributeMap, CreateScenarioRequest, DigitalTwin, Entity, Scenario,
    ScenarioModification, ScenarioPrediction, ScenarioStatus, DEFAULT_BASE_STATE,
};
use crate::store::MetadataStore;

/// Read-only view of entity attributes with scenario overrides applied
#[derive(Debug, Default)]
pub struct ScenarioOverlay {
    overrides: HashMap<String, AttributeMap>,
}

impl ScenarioOverlay {
    /// Later modifications of the same attribute win
    pub fn new(modifications: &[ScenarioModification]) -> Self {
        let mut overrides: HashMap<String, AttributeMap> = HashMap::new();
        for m in modifications {
            overrides
                .entry(m.entity_id.clone())
                .or_default()
                .insert(m.attribute.clone(), m.value.clone());
        }
        Self { overrides }
    }

    /// Attributes of `entity` as the scenario sees them
    pub fn render(&self, entity: &Entity) -> AttributeMap {
        let mut view = entity.attributes.clone();
        if let Some(overrides) = self.overrides.get(&entity.id) {
            for (key, value) in overrides {
                view.insert(key.clone(), value.clone());
            }
        }
        view
    }
}

pub struct ScenarioManager {
    store: Arc<dyn MetadataStore>,
    engine: Arc<InferenceEngine>,
}

impl ScenarioManager {
    pub fn new(store: Arc<dyn MetadataStore>, engine: Arc<InferenceEngine>) -> Self {
        Self { store, engine }
    }

    /// Persist the scenario, then optionally run its predictions.
    ///
    /// Per-entity failures are logged and leave the scenario `partial`.
    pub async fn create_scenario(
        &self,
        twin: &DigitalTwin,
        request: CreateScenarioRequest,
    ) -> Result<Scenario> {
        if request.name.trim().is_empty() {
            return Err(TwinError::validation("scenario name must not be empty"));
        }
        if request.run_predictions {
            ensure_predictions_enabled(twin)?;
            if request.model_ids.is_empty() {
                return Err(TwinError::validation(
                    "run_predictions requires at least one model id",
                ));
            }
        }

        let entities = self.store.list_entities(&twin.id).await?;
        for m in &request.modifications {
            if m.attribute.trim().is_empty() {
                return Err(TwinError::validation("scenario modification needs an attribute"));
            }
            if !entities.iter().any(|e| e.id == m.entity_id) {
                return Err(TwinError::validation(format!(
                    "entity {} does not belong to digital twin {}",
                    m.entity_id, twin.id
                )));
            }
        }

        let mut scenario = Scenario {
            id: new_id(),
            twin_id: twin.id.clone(),
            name: request.name,
            description: request.description,
            base_state: request
                .base_state
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_STATE.to_string()),
            modifications: request.modifications,
            model_ids: request.model_ids,
            predictions: Vec::new(),
            status: ScenarioStatus::Created,
            created_at: Utc::now(),
        };
        self.store.put_scenario(&scenario).await?;

        if request.run_predictions {
            let failures = self.run_predictions(&mut scenario, &entities).await;
            scenario.status = if failures == 0 {
                ScenarioStatus::Completed
            } else {
                ScenarioStatus::Partial
            };
            self.store.put_scenario(&scenario).await?;
        }

        info!(
            twin_id = %twin.id,
            scenario_id = %scenario.id,
            modifications = scenario.modifications.len(),
            predictions = scenario.predictions.len(),
            status = ?scenario.status,
            "Scenario created"
        );
        Ok(scenario)
    }

    /// Run every requested model over every entity, baseline and overlaid.
    /// Returns the number of failed (model, entity) evaluations.
    async fn run_predictions(&self, scenario: &mut Scenario, entities: &[Entity]) -> usize {
        let overlay = ScenarioOverlay::new(&scenario.modifications);
        let mut failures = 0;

        for model_id in &scenario.model_ids {
            let loaded = match self.engine.load_model(model_id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(
                        scenario_id = %scenario.id,
                        model_id = %model_id,
                        error = %e,
                        "Scenario model unavailable"
                    );
                    failures += entities.len().max(1);
                    continue;
                }
            };

            for entity in entities {
                let view = overlay.render(entity);
                let output = match loaded.infer(&view) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(
                            scenario_id = %scenario.id,
                            model_id = %model_id,
                            entity_id = %entity.id,
                            error = %e,
                            "Scenario prediction failed"
                        );
                        failures += 1;
                        continue;
                    }
                };
                let baseline_output = loaded.infer(&entity.attributes).ok().map(|b| b.value);

                scenario.predictions.push(ScenarioPrediction {
                    entity_id: entity.id.clone(),
                    entity_type: entity.entity_type.clone(),
                    model_id: model_id.clone(),
                    baseline_output,
                    output: output.value,
                    confidence: output.confidence,
                });
            }
        }

        failures
    }

    pub async fn get_scenario(&self, twin_id: &str, scenario_id: &str) -> Result<Scenario> {
        self.store
            .get_scenario(scenario_id)
            .await?
            .filter(|s| s.twin_id == twin_id)
            .ok_or_else(|| TwinError::not_found(RecordKind::Scenario, scenario_id))
    }

    pub async fn list_scenarios(&self, twin_id: &str) -> Result<Vec<Scenario>> {
        self.store.list_scenarios(twin_id).await
    }

    pub async fn delete_scenario(&self, twin_id: &str, scenario_id: &str) -> Result<()> {
        self.get_scenario(twin_id, scenario_id).await?;
        self.store.delete_scenario(scenario_id).await?;
        Ok(())
    }
}
