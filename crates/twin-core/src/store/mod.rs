//! Metadata persistence
//!
//! The metadata store is an external collaborator: every record kind is
//! independently addressable by an opaque string id, with list-by-parent
//! queries. Services only ever see the [`MetadataStore`] trait so a
//! database-backed implementation can replace the in-memory one.

mod memory;

pub use memory::InMemoryMetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Action, DigitalTwin, Entity, MlModel, Prediction, Scenario};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Twins
    async fn put_twin(&self, twin: &DigitalTwin) -> Result<()>;
    async fn get_twin(&self, id: &str) -> Result<Option<DigitalTwin>>;
    /// All twins, or only those owned by `project_id`
    async fn list_twins(&self, project_id: Option<&str>) -> Result<Vec<DigitalTwin>>;
    async fn delete_twin(&self, id: &str) -> Result<bool>;

    // Entities
    async fn put_entity(&self, entity: &Entity) -> Result<()>;
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;
    async fn list_entities(&self, twin_id: &str) -> Result<Vec<Entity>>;
    async fn delete_entities_for_twin(&self, twin_id: &str) -> Result<usize>;

    // Models
    async fn put_model(&self, model: &MlModel) -> Result<()>;
    async fn get_model(&self, id: &str) -> Result<Option<MlModel>>;
    async fn list_models(&self, project_id: Option<&str>) -> Result<Vec<MlModel>>;
    async fn delete_model(&self, id: &str) -> Result<bool>;

    // Predictions
    async fn put_prediction(&self, prediction: &Prediction) -> Result<()>;
    async fn get_prediction(&self, id: &str) -> Result<Option<Prediction>>;
    async fn list_predictions(&self, twin_id: &str) -> Result<Vec<Prediction>>;
    async fn delete_prediction(&self, id: &str) -> Result<bool>;
    /// Newest prediction of `twin_id` reusable for the (model, entity) pair at `now`
    async fn find_cached_prediction(
        &self,
        twin_id: &str,
        model_id: &str,
        entity_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Prediction>>;
    async fn delete_predictions_for_entity(&self, entity_id: &str) -> Result<usize>;
    async fn delete_predictions_for_twin(&self, twin_id: &str) -> Result<usize>;
    async fn delete_expired_predictions(&self, now: DateTime<Utc>) -> Result<usize>;

    // Scenarios
    async fn put_scenario(&self, scenario: &Scenario) -> Result<()>;
    async fn get_scenario(&self, id: &str) -> Result<Option<Scenario>>;
    async fn list_scenarios(&self, twin_id: &str) -> Result<Vec<Scenario>>;
    async fn delete_scenario(&self, id: &str) -> Result<bool>;
    async fn delete_scenarios_for_twin(&self, twin_id: &str) -> Result<usize>;

    // Actions
    async fn put_action(&self, action: &Action) -> Result<()>;
    async fn get_action(&self, id: &str) -> Result<Option<Action>>;
    async fn list_actions(&self, twin_id: &str) -> Result<Vec<Action>>;
    async fn delete_action(&self, id: &str) -> Result<bool>;
    async fn delete_actions_for_twin(&self, twin_id: &str) -> Result<usize>;
}
