use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::artifact::{load_artifact, ModelArtifact};
use super::cache::{EntityEpoch, PredictionCache};
use super::features::build_feature_vector;
use super::predictors::{Predictor, PredictorOutput, PredictorRegistry};
use crate::error::{Result, TwinError};
use crate::models::{
    new_id, AttributeMap, BatchPredictionRequest, DigitalTwin, Entity, MlModel, Prediction,
    PredictionKind, PredictionRequest,
};
use crate::observability::TwinMetrics;
use crate::registry::ModelRegistry;

/// Default upper bound on reading one artifact
pub const DEFAULT_ARTIFACT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the inference engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum time spent reading an artifact before failing the request
    pub artifact_load_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_load_timeout: DEFAULT_ARTIFACT_LOAD_TIMEOUT,
        }
    }
}

/// A trained model with its parsed artifact and resolved predictor
pub struct LoadedModel {
    pub model: MlModel,
    pub artifact: ModelArtifact,
    predictor: Arc<dyn Predictor>,
}

impl LoadedModel {
    /// Run the model over an attribute map
    pub fn infer(&self, input: &AttributeMap) -> Result<PredictorOutput> {
        let features = build_feature_vector(&self.artifact.feature_names, input)?;
        self.predictor.predict(&self.artifact, &features)
    }
}

/// Result of a point prediction
#[derive(Debug, Clone, Serialize)]
pub struct PredictOutcome {
    pub prediction: Prediction,
    /// Served from the cache without recomputation
    pub from_cache: bool,
}

/// Entity attributes overlaid by an explicit request input
pub fn effective_input(entity: Option<&Entity>, input: &AttributeMap) -> AttributeMap {
    let mut merged = entity.map(|e| e.attributes.clone()).unwrap_or_default();
    for (key, value) in input {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Produces predictions for entity/model pairs, with a TTL cache
pub struct InferenceEngine {
    registry: Arc<ModelRegistry>,
    predictors: PredictorRegistry,
    cache: PredictionCache,
    config: EngineConfig,
    metrics: TwinMetrics,
}

impl InferenceEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        predictors: PredictorRegistry,
        cache: PredictionCache,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            predictors,
            cache,
            config,
            metrics: TwinMetrics::new(),
        }
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    /// Load a trained model's artifact and resolve its predictor.
    ///
    /// Rejects models that are not `trained`; artifact read, checksum and
    /// parse failures surface as dependency errors.
    pub async fn load_model(&self, model_id: &str) -> Result<LoadedModel> {
        let model = self.registry.require_trained(model_id).await?;
        let path = model.artifact_path.as_deref().ok_or_else(|| {
            TwinError::dependency(format!("trained model {model_id} has no artifact path"))
        })?;

        let artifact = load_artifact(
            Path::new(path),
            model.artifact_checksum.as_deref(),
            self.config.artifact_load_timeout,
        )
        .await?;
        let predictor = self.predictors.resolve(&artifact.model_type)?;

        Ok(LoadedModel {
            model,
            artifact,
            predictor,
        })
    }

    /// Wrap a predictor output into a prediction expiring per the twin's TTL
    pub fn build_prediction(
        &self,
        twin: &DigitalTwin,
        model_id: &str,
        entity: Option<&Entity>,
        input: AttributeMap,
        kind: PredictionKind,
        output: PredictorOutput,
    ) -> Prediction {
        let now = Utc::now();
        Prediction {
            id: new_id(),
            twin_id: twin.id.clone(),
            model_id: model_id.to_string(),
            entity_id: entity.map(|e| e.id.clone()),
            entity_type: entity.map(|e| e.entity_type.clone()),
            kind,
            input,
            output: output.value,
            confidence: output.confidence,
            cached_at: now,
            expires_at: now
                .checked_add_signed(twin.config.prediction_ttl())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Point prediction
    ///
    /// With `use_cache` and an entity, an unexpired prediction for the exact
    /// (model, entity) pair is returned unchanged. Otherwise the model runs
    /// and the fresh prediction is stored. Requests without an entity have
    /// no stable cache key and always compute.
    ///
    /// `observed` is the entity's epoch taken before the entity was read
    /// (`None` takes it now). A result computed from an entity that was
    /// invalidated meanwhile is returned but not kept.
    pub async fn predict(
        &self,
        twin: &DigitalTwin,
        request: &PredictionRequest,
        entity: Option<&Entity>,
        observed: Option<EntityEpoch>,
    ) -> Result<PredictOutcome> {
        ensure_predictions_enabled(twin)?;
        let input = effective_input(entity, &request.input);
        let observed = entity.map(|e| observed.unwrap_or_else(|| self.cache.entity_epoch(&e.id)));

        let cache_entity = if request.use_cache { entity } else { None };
        let prediction = match cache_entity {
            Some(entity) => {
                let _guard = self.cache.lock_key(&request.model_id, &entity.id).await;
                if let Some(hit) = self
                    .cache
                    .lookup(&twin.id, &request.model_id, &entity.id, Utc::now())
                    .await?
                {
                    self.metrics.inc_cache_hits();
                    return Ok(PredictOutcome {
                        prediction: hit,
                        from_cache: true,
                    });
                }
                self.metrics.inc_cache_misses();

                let prediction = self
                    .compute(twin, &request.model_id, Some(entity), input)
                    .await?;
                self.store_prediction(&prediction, observed).await?;
                prediction
            }
            None => {
                let prediction = self.compute(twin, &request.model_id, entity, input).await?;
                self.store_prediction(&prediction, observed).await?;
                prediction
            }
        };

        Ok(PredictOutcome {
            prediction,
            from_cache: false,
        })
    }

    async fn store_prediction(
        &self,
        prediction: &Prediction,
        observed: Option<EntityEpoch>,
    ) -> Result<()> {
        match (prediction.entity_id.as_deref(), observed) {
            (Some(entity_id), Some(epoch)) => {
                self.cache
                    .insert_if_current(prediction, entity_id, epoch)
                    .await?;
                Ok(())
            }
            _ => self.cache.insert(prediction).await,
        }
    }

    /// Compute a point prediction without touching the cache
    pub async fn compute(
        &self,
        twin: &DigitalTwin,
        model_id: &str,
        entity: Option<&Entity>,
        input: AttributeMap,
    ) -> Result<Prediction> {
        let start = Instant::now();

        let output = match self.load_model(model_id).await {
            Ok(loaded) => loaded.infer(&input),
            Err(e) => Err(e),
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                self.metrics.inc_prediction_errors();
                return Err(e);
            }
        };

        self.metrics
            .observe_prediction_latency(start.elapsed().as_secs_f64());
        self.metrics.inc_predictions_generated();

        Ok(self.build_prediction(twin, model_id, entity, input, PredictionKind::Point, output))
    }

    /// Batch prediction over independent input rows
    ///
    /// The artifact is loaded once; a row that fails is logged and skipped.
    pub async fn batch_predict(
        &self,
        twin: &DigitalTwin,
        request: &BatchPredictionRequest,
    ) -> Result<Vec<Prediction>> {
        ensure_predictions_enabled(twin)?;
        let start = Instant::now();
        let loaded = self.load_model(&request.model_id).await?;

        let mut predictions = Vec::with_capacity(request.inputs.len());
        for (row, input) in request.inputs.iter().enumerate() {
            let output = match loaded.infer(input) {
                Ok(output) => output,
                Err(e) => {
                    self.metrics.inc_prediction_errors();
                    warn!(
                        twin_id = %twin.id,
                        model_id = %request.model_id,
                        row,
                        error = %e,
                        "Batch row failed, skipping"
                    );
                    continue;
                }
            };

            let prediction = self.build_prediction(
                twin,
                &request.model_id,
                None,
                input.clone(),
                PredictionKind::Batch,
                output,
            );
            if let Err(e) = self.cache.insert(&prediction).await {
                self.metrics.inc_prediction_errors();
                warn!(row, error = %e, "Failed to store batch prediction, skipping");
                continue;
            }
            self.metrics.inc_predictions_generated();
            predictions.push(prediction);
        }

        self.metrics
            .observe_prediction_latency(start.elapsed().as_secs_f64());
        debug!(
            twin_id = %twin.id,
            model_id = %request.model_id,
            rows = request.inputs.len(),
            produced = predictions.len(),
            "Batch prediction finished"
        );
        Ok(predictions)
    }
}

/// Reject prediction and action entry points on twins with predictions off
pub fn ensure_predictions_enabled(twin: &DigitalTwin) -> Result<()> {
    if !twin.config.enable_predictions {
        return Err(TwinError::capability(format!(
            "predictions are disabled for digital twin {}",
            twin.id
        )));
    }
    Ok(())
}
