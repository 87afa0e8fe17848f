//! Model registry
//!
//! Tracks model identity and lifecycle. Training runs out of process and
//! reports back through [`ModelRegistry::apply_status_update`]; when a model
//! becomes `trained` the registry fingerprints its artifact so the engine
//! can detect a swapped or corrupted file later.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{RecordKind, Result, TwinError};
use crate::inference::{compute_checksum, read_artifact_bytes, ModelKind};
use crate::models::{new_id, MlModel, ModelStatus, ModelStatusUpdate, RegisterModelRequest};
use crate::store::MetadataStore;

pub struct ModelRegistry {
    store: Arc<dyn MetadataStore>,
    artifact_timeout: Duration,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, artifact_timeout: Duration) -> Self {
        Self {
            store,
            artifact_timeout,
        }
    }

    /// Register a new model in `draft`
    pub async fn register(&self, request: RegisterModelRequest) -> Result<MlModel> {
        if request.name.trim().is_empty() {
            return Err(TwinError::validation("model name must not be empty"));
        }
        if request.project_id.trim().is_empty() {
            return Err(TwinError::validation("model project_id must not be empty"));
        }
        request.model_type.parse::<ModelKind>()?;

        let now = Utc::now();
        let model = MlModel {
            id: new_id(),
            project_id: request.project_id,
            name: request.name,
            model_type: request.model_type,
            status: ModelStatus::Draft,
            artifact_path: None,
            artifact_checksum: None,
            metrics: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_model(&model).await?;

        info!(model_id = %model.id, model_type = %model.model_type, "Model registered");
        Ok(model)
    }

    pub async fn get(&self, model_id: &str) -> Result<MlModel> {
        self.store
            .get_model(model_id)
            .await?
            .ok_or_else(|| TwinError::not_found(RecordKind::Model, model_id))
    }

    pub async fn list(&self, project_id: Option<&str>) -> Result<Vec<MlModel>> {
        self.store.list_models(project_id).await
    }

    pub async fn delete(&self, model_id: &str) -> Result<()> {
        if !self.store.delete_model(model_id).await? {
            return Err(TwinError::not_found(RecordKind::Model, model_id));
        }
        Ok(())
    }

    /// Apply a trainer status report
    ///
    /// `trained` requires an artifact path and records its checksum;
    /// `failed` keeps the reported error.
    pub async fn apply_status_update(
        &self,
        model_id: &str,
        update: ModelStatusUpdate,
    ) -> Result<MlModel> {
        let mut model = self.get(model_id).await?;

        if !model.status.can_transition_to(update.status) {
            return Err(TwinError::InvalidTransition {
                kind: RecordKind::Model,
                id: model_id.to_string(),
                from: model.status.to_string(),
                to: update.status.to_string(),
            });
        }

        match update.status {
            ModelStatus::Trained => {
                let path = update
                    .artifact_path
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        TwinError::validation("trained status update requires artifact_path")
                    })?;
                let bytes = read_artifact_bytes(Path::new(&path), self.artifact_timeout).await?;
                model.artifact_checksum = Some(compute_checksum(&bytes));
                model.artifact_path = Some(path);
                model.metrics = update.metrics;
                model.error = None;
            }
            ModelStatus::Failed => {
                model.error = Some(
                    update
                        .error
                        .unwrap_or_else(|| "training failed".to_string()),
                );
            }
            _ => {}
        }

        let from = model.status;
        model.status = update.status;
        model.updated_at = Utc::now();
        self.store.put_model(&model).await?;

        info!(
            model_id = %model_id,
            from = %from,
            to = %model.status,
            "Model status updated"
        );
        Ok(model)
    }

    /// Fetch a model that is allowed to serve inference
    pub async fn require_trained(&self, model_id: &str) -> Result<MlModel> {
        let model = self.get(model_id).await?;
        if model.status != ModelStatus::Trained {
            return Err(TwinError::validation(format!(
                "model {model_id} is not trained (status {})",
                model.status
            )));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::InMemoryMetadataStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(InMemoryMetadataStore::new()), Duration::from_secs(5))
    }

    fn request(model_type: &str) -> RegisterModelRequest {
        RegisterModelRequest {
            project_id: "proj-1".into(),
            name: "load forecast".into(),
            model_type: model_type.into(),
        }
    }

    fn update(status: ModelStatus) -> ModelStatusUpdate {
        ModelStatusUpdate {
            status,
            artifact_path: None,
            metrics: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_register_starts_in_draft() {
        let registry = registry();
        let model = registry.register(request("regression")).await.unwrap();
        assert_eq!(model.status, ModelStatus::Draft);

        let err = registry.register(request("svm")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_training_lifecycle_records_checksum() {
        let registry = registry();
        let model = registry.register(request("regression")).await.unwrap();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"model_type":"regression","feature_names":[]}"#)
            .unwrap();

        registry
            .apply_status_update(&model.id, update(ModelStatus::Training))
            .await
            .unwrap();
        let trained = registry
            .apply_status_update(
                &model.id,
                ModelStatusUpdate {
                    artifact_path: Some(file.path().display().to_string()),
                    ..update(ModelStatus::Trained)
                },
            )
            .await
            .unwrap();

        assert_eq!(trained.status, ModelStatus::Trained);
        assert_eq!(trained.artifact_checksum.as_ref().map(String::len), Some(64));
        assert!(registry.require_trained(&model.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let registry = registry();
        let model = registry.register(request("decision_tree")).await.unwrap();

        let err = registry
            .apply_status_update(&model.id, update(ModelStatus::Trained))
            .await
            .unwrap_err();
        assert!(matches!(err, TwinError::InvalidTransition { .. }));

        registry
            .apply_status_update(&model.id, update(ModelStatus::Training))
            .await
            .unwrap();
        let failed = registry
            .apply_status_update(
                &model.id,
                ModelStatusUpdate {
                    error: Some("diverged".into()),
                    ..update(ModelStatus::Failed)
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("diverged"));

        let err = registry.require_trained(&model.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_trained_requires_artifact_path() {
        let registry = registry();
        let model = registry.register(request("regression")).await.unwrap();
        registry
            .apply_status_update(&model.id, update(ModelStatus::Training))
            .await
            .unwrap();

        let err = registry
            .apply_status_update(&model.id, update(ModelStatus::Trained))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(registry.get(&model.id).await.unwrap().status, ModelStatus::Training);
    }
}
