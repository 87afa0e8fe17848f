use serde_json::Value;

use crate::error::{Result, TwinError};
use crate::models::AttributeMap;

/// Scalar view of a feature value. Numbers pass through, booleans map to
/// 1/0; every other kind is rejected.
pub fn feature_scalar(name: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| TwinError::validation(format!("feature {name} is not representable as f64"))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(TwinError::validation(format!(
            "feature {name} has unsupported value kind: {}",
            value_kind(other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fixed-length feature vector in artifact order. Missing features are 0.
pub fn build_feature_vector(feature_names: &[String], input: &AttributeMap) -> Result<Vec<f64>> {
    feature_names
        .iter()
        .map(|name| match input.get(name) {
            Some(value) => feature_scalar(name, value),
            None => Ok(0.0),
        })
        .collect()
}
