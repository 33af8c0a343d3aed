//! Boundary validation for agent replies.
//!
//! Agents exchange opaque JSON. Orchestration logic only ever sees a
//! [`ReplyShape`]: one of the shapes the pipeline knows about, or an
//! [`ReplyShape::Opaque`] value that passed the generic checks.

use crate::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Machine-readable error object reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentErrorBody {
    /// Machine-readable category, e.g. `invalid_query`.
    pub error_type: String,
    /// Human-readable detail.
    pub message: String,
}

impl AgentErrorBody {
    /// Find an error report inside a reply, if the agent sent one.
    ///
    /// Accepts a top-level `{error_type, message}`, a nested
    /// `{error: {error_type, message}}`, or `{error: "text"}`.
    pub fn extract(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if let (Some(Value::String(t)), Some(Value::String(m))) =
            (obj.get("error_type"), obj.get("message"))
        {
            return Some(Self {
                error_type: t.clone(),
                message: m.clone(),
            });
        }
        match obj.get("error")? {
            Value::Object(inner) => Some(Self {
                error_type: inner
                    .get("error_type")
                    .and_then(Value::as_str)
                    .unwrap_or("agent_error")
                    .to_string(),
                message: inner
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Value::String(msg) => Some(Self {
                error_type: "agent_error".to_string(),
                message: msg.clone(),
            }),
            _ => None,
        }
    }
}

/// Which reply shape a caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeHint {
    /// A JSON object describing the parsed query.
    Interpretation,
    /// A [`Dataset`].
    Dataset,
    /// A [`Chart`].
    Chart,
    /// No expectation beyond the generic checks.
    Opaque,
}

/// Tabular data returned by a data agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Column names, possibly empty.
    #[serde(default)]
    pub columns: Vec<String>,
    /// One entry per row. Also accepted as `data`.
    #[serde(alias = "data")]
    pub rows: Vec<Value>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chart specification returned by a visualization agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    /// The chart specification. Also accepted as `spec`.
    #[serde(alias = "spec")]
    pub chart: Value,
    /// Optional chart family, e.g. `bar`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated agent reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyShape {
    /// Structured interpretation of a natural-language query.
    Interpretation(Map<String, Value>),
    /// Tabular data.
    Dataset(Dataset),
    /// A chart specification.
    Chart(Chart),
    /// Any JSON object that passed the generic checks.
    Opaque(Value),
}

impl ReplyShape {
    /// Validate a raw reply against the expected shape.
    ///
    /// An embedded agent error report wins over shape checks.
    pub fn parse(hint: ShapeHint, value: Value) -> ConduitResult<Self> {
        if let Some(body) = AgentErrorBody::extract(&value) {
            return Err(ConduitError::from_agent_body(body));
        }
        if !value.is_object() {
            return Err(ConduitError::Validation(format!(
                "expected a JSON object reply, got {}",
                type_name(&value)
            )));
        }

        match hint {
            ShapeHint::Interpretation => match value {
                Value::Object(map) if !map.is_empty() => Ok(ReplyShape::Interpretation(map)),
                _ => Err(ConduitError::Validation(
                    "interpretation reply is empty".into(),
                )),
            },
            ShapeHint::Dataset => serde_json::from_value::<Dataset>(value)
                .map(ReplyShape::Dataset)
                .map_err(|e| ConduitError::Validation(format!("invalid dataset reply: {e}"))),
            ShapeHint::Chart => serde_json::from_value::<Chart>(value)
                .map(ReplyShape::Chart)
                .map_err(|e| ConduitError::Validation(format!("invalid chart reply: {e}"))),
            ShapeHint::Opaque => Ok(ReplyShape::Opaque(value)),
        }
    }

    /// Convert back to JSON for forwarding to the next stage.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
