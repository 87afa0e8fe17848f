use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::MetadataStore;
use crate::error::Result;
use crate::models::{Action, DigitalTwin, Entity, MlModel, Prediction, Scenario};

/// Process-local metadata store backed by concurrent hash maps.
///
/// List results are sorted by creation time so callers see a stable order.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    twins: DashMap<String, DigitalTwin>,
    entities: DashMap<String, Entity>,
    models: DashMap<String, MlModel>,
    predictions: DashMap<String, Prediction>,
    scenarios: DashMap<String, Scenario>,
    actions: DashMap<String, Action>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn collect_where<T, F>(map: &DashMap<String, T>, keep: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    map.iter()
        .filter(|entry| keep(entry.value()))
        .map(|entry| entry.value().clone())
        .collect()
}

fn remove_where<T, F>(map: &DashMap<String, T>, matches: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut removed = 0;
    map.retain(|_, value| {
        if matches(value) {
            removed += 1;
            false
        } else {
            true
        }
    });
    removed
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put_twin(&self, twin: &DigitalTwin) -> Result<()> {
        self.twins.insert(twin.id.clone(), twin.clone());
        Ok(())
    }

    async fn get_twin(&self, id: &str) -> Result<Option<DigitalTwin>> {
        Ok(self.twins.get(id).map(|t| t.clone()))
    }

    async fn list_twins(&self, project_id: Option<&str>) -> Result<Vec<DigitalTwin>> {
        let mut twins = collect_where(&self.twins, |t| {
            project_id.map_or(true, |p| t.project_id == p)
        });
        twins.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(twins)
    }

    async fn delete_twin(&self, id: &str) -> Result<bool> {
        Ok(self.twins.remove(id).is_some())
    }

    async fn put_entity(&self, entity: &Entity) -> Result<()> {
        self.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.entities.get(id).map(|e| e.clone()))
    }

    async fn list_entities(&self, twin_id: &str) -> Result<Vec<Entity>> {
        let mut entities = collect_where(&self.entities, |e| e.twin_id == twin_id);
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entities)
    }

    async fn delete_entities_for_twin(&self, twin_id: &str) -> Result<usize> {
        Ok(remove_where(&self.entities, |e| e.twin_id == twin_id))
    }

    async fn put_model(&self, model: &MlModel) -> Result<()> {
        self.models.insert(model.id.clone(), model.clone());
        Ok(())
    }

    async fn get_model(&self, id: &str) -> Result<Option<MlModel>> {
        Ok(self.models.get(id).map(|m| m.clone()))
    }

    async fn list_models(&self, project_id: Option<&str>) -> Result<Vec<MlModel>> {
        let mut models = collect_where(&self.models, |m| {
            project_id.map_or(true, |p| m.project_id == p)
        });
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(models)
    }

    async fn delete_model(&self, id: &str) -> Result<bool> {
        Ok(self.models.remove(id).is_some())
    }

    async fn put_prediction(&self, prediction: &Prediction) -> Result<()> {
        self.predictions
            .insert(prediction.id.clone(), prediction.clone());
        Ok(())
    }

    async fn get_prediction(&self, id: &str) -> Result<Option<Prediction>> {
        Ok(self.predictions.get(id).map(|p| p.clone()))
    }

    async fn list_predictions(&self, twin_id: &str) -> Result<Vec<Prediction>> {
        let mut predictions = collect_where(&self.predictions, |p| p.twin_id == twin_id);
        predictions.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.id.cmp(&b.id)));
        Ok(predictions)
    }

    async fn delete_prediction(&self, id: &str) -> Result<bool> {
        Ok(self.predictions.remove(id).is_some())
    }

    async fn find_cached_prediction(
        &self,
        twin_id: &str,
        model_id: &str,
        entity_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Prediction>> {
        Ok(self
            .predictions
            .iter()
            .filter(|p| p.twin_id == twin_id && p.is_reusable_for(model_id, entity_id, now))
            .max_by(|a, b| a.cached_at.cmp(&b.cached_at))
            .map(|p| p.value().clone()))
    }

    async fn delete_predictions_for_entity(&self, entity_id: &str) -> Result<usize> {
        Ok(remove_where(&self.predictions, |p| {
            p.entity_id.as_deref() == Some(entity_id)
        }))
    }

    async fn delete_predictions_for_twin(&self, twin_id: &str) -> Result<usize> {
        Ok(remove_where(&self.predictions, |p| p.twin_id == twin_id))
    }

    async fn delete_expired_predictions(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(remove_where(&self.predictions, |p| now >= p.expires_at))
    }

    async fn put_scenario(&self, scenario: &Scenario) -> Result<()> {
        self.scenarios.insert(scenario.id.clone(), scenario.clone());
        Ok(())
    }

    async fn get_scenario(&self, id: &str) -> Result<Option<Scenario>> {
        Ok(self.scenarios.get(id).map(|s| s.clone()))
    }

    async fn list_scenarios(&self, twin_id: &str) -> Result<Vec<Scenario>> {
        let mut scenarios = collect_where(&self.scenarios, |s| s.twin_id == twin_id);
        scenarios.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(scenarios)
    }

    async fn delete_scenario(&self, id: &str) -> Result<bool> {
        Ok(self.scenarios.remove(id).is_some())
    }

    async fn delete_scenarios_for_twin(&self, twin_id: &str) -> Result<usize> {
        Ok(remove_where(&self.scenarios, |s| s.twin_id == twin_id))
    }

    async fn put_action(&self, action: &Action) -> Result<()> {
        self.actions.insert(action.id.clone(), action.clone());
        Ok(())
    }

    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        Ok(self.actions.get(id).map(|a| a.clone()))
    }

    async fn list_actions(&self, twin_id: &str) -> Result<Vec<Action>> {
        let mut actions = collect_where(&self.actions, |a| a.twin_id == twin_id);
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(actions)
    }

    async fn delete_action(&self, id: &str) -> Result<bool> {
        Ok(self.actions.remove(id).is_some())
    }

    async fn delete_actions_for_twin(&self, twin_id: &str) -> Result<usize> {
        Ok(remove_where(&self.actions, |a| a.twin_id == twin_id))
    }
}
