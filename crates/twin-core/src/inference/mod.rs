//! Inference engine
//!
//! Loads trained model artifacts, dispatches on the artifact's model type
//! and keeps a TTL cache of point predictions per (model, entity) pair.

mod artifact;
mod cache;
mod engine;
mod features;
mod predictors;

pub use artifact::{compute_checksum, load_artifact, read_artifact_bytes, ModelArtifact};
pub use cache::{EntityEpoch, PredictionCache};
pub use engine::{
    effective_input, ensure_predictions_enabled, EngineConfig, InferenceEngine, LoadedModel,
    PredictOutcome, DEFAULT_ARTIFACT_LOAD_TIMEOUT,
};
pub use features::{build_feature_vector, feature_scalar};
pub use predictors::{
    ModelKind, PlaceholderPredictor, Predictor, PredictorOutput, PredictorRegistry,
    RegressionPredictor, DEFAULT_PREDICTION_PARAM,
};
