//! Threshold comparison for action conditions

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Condition;

/// Comparison operator of an action condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "gt", alias = ">")]
    Greater,
    #[serde(rename = "gte", alias = ">=")]
    GreaterOrEqual,
    #[serde(rename = "lt", alias = "<")]
    Less,
    #[serde(rename = "lte", alias = "<=")]
    LessOrEqual,
    #[serde(rename = "eq", alias = "==")]
    Equal,
    #[serde(rename = "ne", alias = "!=")]
    NotEqual,
}

impl Operator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Greater => value > threshold,
            Operator::GreaterOrEqual => value >= threshold,
            Operator::Less => value < threshold,
            Operator::LessOrEqual => value <= threshold,
            Operator::Equal => value == threshold,
            Operator::NotEqual => value != threshold,
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Greater => "gt",
            Operator::GreaterOrEqual => "gte",
            Operator::Less => "lt",
            Operator::LessOrEqual => "lte",
            Operator::Equal => "eq",
            Operator::NotEqual => "ne",
        };
        f.write_str(s)
    }
}

/// Numeric view of a prediction output. Only JSON numbers qualify.
pub fn numeric_output(output: &Value) -> Option<f64> {
    match output {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

impl Condition {
    /// True when the output is numeric and satisfies the comparison
    pub fn matches(&self, output: &Value) -> bool {
        numeric_output(output)
            .map(|value| self.operator.compare(value, self.threshold))
            .unwrap_or(false)
    }
}
