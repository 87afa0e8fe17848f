//! Model-type dispatch
//!
//! Each supported model type maps to one [`Predictor`]. The set is an
//! explicit [`PredictorRegistry`] handed to the engine, so tests and future
//! real tree/ensemble/network evaluators can be swapped in per instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::artifact::ModelArtifact;
use crate::error::{Result, TwinError};

/// Parameter read by the placeholder predictors
pub const DEFAULT_PREDICTION_PARAM: &str = "default_prediction";

/// Fixed confidence of every regression output
pub const REGRESSION_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Regression,
    DecisionTree,
    RandomForest,
    NeuralNetwork,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Regression,
        ModelKind::DecisionTree,
        ModelKind::RandomForest,
        ModelKind::NeuralNetwork,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Regression => "regression",
            ModelKind::DecisionTree => "decision_tree",
            ModelKind::RandomForest => "random_forest",
            ModelKind::NeuralNetwork => "neural_network",
        }
    }

    /// Confidence reported by the placeholder implementation of this kind
    pub fn placeholder_confidence(self) -> f64 {
        match self {
            ModelKind::Regression => REGRESSION_CONFIDENCE,
            ModelKind::DecisionTree => 0.85,
            ModelKind::RandomForest => 0.9,
            ModelKind::NeuralNetwork => 0.8,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelKind {
    type Err = TwinError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TwinError::validation(format!("unsupported model type: {s}")))
    }
}

/// Raw predictor result before it is wrapped into a `Prediction`
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorOutput {
    pub value: Value,
    pub confidence: f64,
}

/// Trait for model-type specific evaluation
pub trait Predictor: Send + Sync {
    /// Model type this predictor serves
    fn kind(&self) -> ModelKind;

    /// Evaluate `features` (in `artifact.feature_names` order)
    fn predict(&self, artifact: &ModelArtifact, features: &[f64]) -> Result<PredictorOutput>;
}

/// Linear model: `intercept + sum(weight_i * feature_i)`
pub struct RegressionPredictor;

impl RegressionPredictor {
    fn number(artifact: &ModelArtifact, name: &str, value: &Value) -> Result<f64> {
        value.as_f64().ok_or_else(|| {
            TwinError::dependency(format!(
                "artifact parameter {name} of {} model is not numeric",
                artifact.model_type
            ))
        })
    }
}

impl Predictor for RegressionPredictor {
    fn kind(&self) -> ModelKind {
        ModelKind::Regression
    }

    fn predict(&self, artifact: &ModelArtifact, features: &[f64]) -> Result<PredictorOutput> {
        let weights = match artifact.parameter("weights") {
            Some(Value::Array(values)) => values
                .iter()
                .map(|w| Self::number(artifact, "weights", w))
                .collect::<Result<Vec<f64>>>()?,
            Some(_) => {
                return Err(TwinError::dependency(
                    "regression artifact parameter weights is not an array",
                ))
            }
            None => {
                return Err(TwinError::dependency(
                    "regression artifact is missing parameter weights",
                ))
            }
        };

        if weights.len() != features.len() {
            return Err(TwinError::dependency(format!(
                "regression artifact has {} weights for {} features",
                weights.len(),
                features.len()
            )));
        }

        let intercept = match artifact.parameter("intercept") {
            Some(value) => Self::number(artifact, "intercept", value)?,
            None => 0.0,
        };

        let mut acc = intercept;
        for (weight, feature) in weights.iter().zip(features) {
            acc += weight * feature;
        }

        if !acc.is_finite() {
            return Err(TwinError::dependency("regression output is not finite"));
        }

        Ok(PredictorOutput {
            value: Value::from(acc),
            confidence: REGRESSION_CONFIDENCE,
        })
    }
}

/// Stand-in for tree, ensemble and network models: returns the artifact's
/// `default_prediction` parameter with a per-kind confidence.
pub struct PlaceholderPredictor {
    kind: ModelKind,
}

impl PlaceholderPredictor {
    pub fn new(kind: ModelKind) -> Self {
        Self { kind }
    }
}

impl Predictor for PlaceholderPredictor {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn predict(&self, artifact: &ModelArtifact, _features: &[f64]) -> Result<PredictorOutput> {
        let value = match artifact.parameter(DEFAULT_PREDICTION_PARAM) {
            Some(value) => value.clone(),
            None => {
                warn!(
                    model_type = %self.kind,
                    "Artifact has no default_prediction, returning 0"
                );
                Value::from(0.0)
            }
        };

        Ok(PredictorOutput {
            value,
            confidence: self.kind.placeholder_confidence(),
        })
    }
}

/// Predictors keyed by the model type they serve
#[derive(Clone)]
pub struct PredictorRegistry {
    predictors: HashMap<ModelKind, Arc<dyn Predictor>>,
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PredictorRegistry {
    pub fn empty() -> Self {
        Self {
            predictors: HashMap::new(),
        }
    }

    /// Regression plus the placeholder tree/forest/network predictors
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RegressionPredictor));
        for kind in [
            ModelKind::DecisionTree,
            ModelKind::RandomForest,
            ModelKind::NeuralNetwork,
        ] {
            registry.register(Arc::new(PlaceholderPredictor::new(kind)));
        }
        registry
    }

    /// Install or replace the predictor for its kind
    pub fn register(&mut self, predictor: Arc<dyn Predictor>) {
        self.predictors.insert(predictor.kind(), predictor);
    }

    /// Resolve the predictor for an artifact's model-type tag
    pub fn resolve(&self, model_type: &str) -> Result<Arc<dyn Predictor>> {
        let kind: ModelKind = model_type
            .parse()
            .map_err(|_| TwinError::dependency(format!("unsupported model type: {model_type}")))?;
        self.predictors
            .get(&kind)
            .cloned()
            .ok_or_else(|| TwinError::dependency(format!("no predictor registered for {kind}")))
    }
}
