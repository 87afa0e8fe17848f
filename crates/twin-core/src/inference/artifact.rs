//! Serialized model artifacts
//!
//! An artifact is a self-describing JSON document written by the
//! out-of-process trainer: a model-type tag, the ordered feature names the
//! model consumes, a named parameter bag and optional metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TwinError};
use crate::models::AttributeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: String,
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: AttributeMap,
}

impl ModelArtifact {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// Compute SHA256 checksum of artifact bytes
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Read raw artifact bytes, failing if the read does not finish in `timeout`
pub async fn read_artifact_bytes(path: &Path, timeout: Duration) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, tokio::fs::read(path)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(TwinError::dependency(format!(
            "failed to read artifact {}: {e}",
            path.display()
        ))),
        Err(_) => Err(TwinError::dependency(format!(
            "timed out after {}ms reading artifact {}",
            timeout.as_millis(),
            path.display()
        ))),
    }
}

/// Load and parse an artifact. When `expected_checksum` is given the bytes
/// must hash to it.
pub async fn load_artifact(
    path: &Path,
    expected_checksum: Option<&str>,
    timeout: Duration,
) -> Result<ModelArtifact> {
    let bytes = read_artifact_bytes(path, timeout).await?;

    if let Some(expected) = expected_checksum {
        let computed = compute_checksum(&bytes);
        if computed != expected {
            return Err(TwinError::dependency(format!(
                "artifact checksum mismatch for {}: expected {expected}, got {computed}",
                path.display()
            )));
        }
    }

    let artifact: ModelArtifact = serde_json::from_slice(&bytes).map_err(|e| {
        TwinError::dependency(format!("failed to parse artifact {}: {e}", path.display()))
    })?;

    debug!(
        path = %path.display(),
        model_type = %artifact.model_type,
        features = artifact.feature_names.len(),
        "Artifact loaded"
    );
    Ok(artifact)
}
