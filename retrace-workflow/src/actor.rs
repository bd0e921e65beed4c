use async_trait::async_trait;
use retrace::{AutomationError, Page};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    document::{InputType, WorkflowDocument},
    Result, WorkflowError,
};

/// What the autonomous actor reports after working on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorOutcome {
    pub success: bool,
    pub summary: String,
    pub steps_taken: u32,
}

impl ActorOutcome {
    pub fn succeeded(summary: impl Into<String>, steps_taken: u32) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            steps_taken,
        }
    }

    pub fn failed(summary: impl Into<String>, steps_taken: u32) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            steps_taken,
        }
    }
}

/// A goal-driven agent that works on the same page as the replay, taking at
/// most `max_steps` actions.
#[async_trait]
pub trait AutonomousActor: Send + Sync {
    async fn attempt(
        &self,
        task: &str,
        page: &dyn Page,
        max_steps: u32,
    ) -> std::result::Result<ActorOutcome, AutomationError>;
}

/// Stand-in used when no actor is configured; every attempt fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActor;

#[async_trait]
impl AutonomousActor for NoActor {
    async fn attempt(
        &self,
        task: &str,
        _page: &dyn Page,
        _max_steps: u32,
    ) -> std::result::Result<ActorOutcome, AutomationError> {
        warn!(task, "no autonomous actor configured");
        Ok(ActorOutcome::failed("no autonomous actor configured", 0))
    }
}

/// Derives the input map for a run from a free-form prompt.
#[async_trait]
pub trait InputResolver: Send + Sync {
    async fn resolve(&self, document: &WorkflowDocument, prompt: &str)
        -> Result<Map<String, Value>>;
}

/// Reads inputs from a JSON object or from `name=value` pairs separated by
/// whitespace or newlines. Values are coerced to the declared input type.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptInputResolver;

#[async_trait]
impl InputResolver for PromptInputResolver {
    async fn resolve(
        &self,
        document: &WorkflowDocument,
        prompt: &str,
    ) -> Result<Map<String, Value>> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(Map::new());
        }
        if prompt.starts_with('{') {
            return match serde_json::from_str::<Value>(prompt)? {
                Value::Object(map) => Ok(map),
                _ => Err(WorkflowError::InvalidInputs(
                    "prompt JSON must be an object".into(),
                )),
            };
        }

        let mut inputs = Map::new();
        for pair in prompt.split_whitespace() {
            let Some((name, raw)) = pair.split_once('=') else {
                return Err(WorkflowError::InvalidInputs(format!(
                    "expected name=value, got '{pair}'"
                )));
            };
            let value = match document.input_schema.properties.get(name) {
                Some(property) => coerce(property.kind, raw).ok_or_else(|| {
                    WorkflowError::InvalidInputs(format!(
                        "input '{name}' must be a {}, got '{raw}'",
                        property.kind.as_str()
                    ))
                })?,
                None => Value::String(raw.to_string()),
            };
            inputs.insert(name.to_string(), value);
        }
        Ok(inputs)
    }
}

fn coerce(kind: InputType, raw: &str) -> Option<Value> {
    match kind {
        InputType::String => Some(Value::String(raw.to_string())),
        InputType::Number => match raw.parse::<i64>() {
            Ok(n) => Some(Value::from(n)),
            Err(_) => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
        },
        InputType::Boolean => raw.parse::<bool>().ok().map(Value::Bool),
    }
}
