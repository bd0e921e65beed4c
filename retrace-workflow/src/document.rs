use std::collections::BTreeMap;
use std::path::Path;

use retrace::{actions::ParamType, ActionRegistry, ActionSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    placeholders::{self, Substitution},
    Result, WorkflowError,
};

pub const DEFAULT_VERSION: &str = "1.0";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_schema_type() -> String {
    "object".to_string()
}

/// A replayable workflow: metadata, the inputs it accepts and an ordered list
/// of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, alias = "inputs", alias = "input_schema")]
    pub input_schema: InputSchema,
    #[serde(alias = "events")]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, InputProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputProperty {
    #[serde(rename = "type")]
    pub kind: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
}

impl InputType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
        }
    }
}

/// One workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StepSpec {
    /// Replay a registered action with fixed params. `max_steps` bounds the
    /// actor if the action fails and fallback is enabled.
    Deterministic {
        action: String,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default)]
        description: String,
        #[serde(default, alias = "max_steps", skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
    },
    /// Hand a natural-language task to the autonomous actor.
    Agent {
        task: String,
        #[serde(default, alias = "max_steps", skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
        #[serde(default)]
        description: String,
    },
}

impl StepSpec {
    pub fn deterministic(
        action: impl Into<String>,
        params: Map<String, Value>,
        description: impl Into<String>,
    ) -> Self {
        StepSpec::Deterministic {
            action: action.into(),
            params,
            description: description.into(),
            max_steps: None,
        }
    }

    pub fn agent(task: impl Into<String>, max_steps: Option<u32>) -> Self {
        StepSpec::Agent {
            task: task.into(),
            max_steps,
            description: String::new(),
        }
    }

    pub fn max_steps(&self) -> Option<u32> {
        match self {
            StepSpec::Deterministic { max_steps, .. } | StepSpec::Agent { max_steps, .. } => {
                *max_steps
            }
        }
    }

    pub fn description(&self) -> &str {
        match self {
            StepSpec::Deterministic { description, .. } | StepSpec::Agent { description, .. } => {
                description
            }
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            StepSpec::Deterministic { .. } => "deterministic",
            StepSpec::Agent { .. } => "agent",
        }
    }

    /// Human-readable label for logs and reports.
    pub fn title(&self) -> String {
        match self {
            StepSpec::Deterministic {
                action,
                description,
                ..
            } => {
                if description.is_empty() {
                    action.clone()
                } else {
                    description.clone()
                }
            }
            StepSpec::Agent {
                task, description, ..
            } => {
                if description.is_empty() {
                    task.clone()
                } else {
                    description.clone()
                }
            }
        }
    }

    /// Names of every `{{placeholder}}` in params, task and description.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        match self {
            StepSpec::Deterministic {
                params,
                description,
                ..
            } => {
                for value in params.values() {
                    placeholders::collect(value, &mut names);
                }
                placeholders::collect_str(description, &mut names);
            }
            StepSpec::Agent {
                task, description, ..
            } => {
                placeholders::collect_str(task, &mut names);
                placeholders::collect_str(description, &mut names);
            }
        }
        names
    }

    /// Copy of the step with placeholders replaced from `inputs`.
    pub fn resolve(&self, inputs: &Value) -> Substitution<StepSpec> {
        self.resolve_for(inputs, None)
    }

    /// Like [`Self::resolve`], but params the action declares as strings
    /// receive the input rendered as text, whatever its JSON type.
    pub fn resolve_for(
        &self,
        inputs: &Value,
        spec: Option<&ActionSpec>,
    ) -> Substitution<StepSpec> {
        let mut unresolved = Vec::new();
        let resolved = match self {
            StepSpec::Deterministic {
                action,
                params,
                description,
                max_steps,
            } => {
                let mut params = params.clone();
                let as_text = |name: &str| {
                    spec.and_then(|s| s.param_kind(name)) == Some(ParamType::String)
                };
                unresolved.extend(placeholders::substitute_params(
                    &mut params,
                    inputs,
                    as_text,
                ));
                let description = placeholders::substitute_str(description, inputs);
                unresolved.extend(description.unresolved);
                StepSpec::Deterministic {
                    action: action.clone(),
                    params,
                    description: description.value,
                    max_steps: *max_steps,
                }
            }
            StepSpec::Agent {
                task,
                max_steps,
                description,
            } => {
                let task = placeholders::substitute_str(task, inputs);
                let description = placeholders::substitute_str(description, inputs);
                unresolved.extend(task.unresolved);
                unresolved.extend(description.unresolved);
                StepSpec::Agent {
                    task: task.value,
                    max_steps: *max_steps,
                    description: description.value,
                }
            }
        };
        Substitution::new(resolved, unresolved)
    }
}

impl WorkflowDocument {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: default_version(),
            input_schema: InputSchema::default(),
            steps: Vec::new(),
        }
    }

    /// Parse a document, accepting steps tagged with the older `type` key.
    ///
    /// A `type` of `deterministic` or `agent` is renamed to `kind`; any other
    /// `type` names the action of a deterministic step, whose params are
    /// either its `params` object or its remaining keys.
    pub fn from_json(mut value: Value) -> Result<Self> {
        let obj = value.as_object_mut().ok_or_else(|| {
            WorkflowError::InvalidDocument("document must be a JSON object".into())
        })?;
        for key in ["steps", "events"] {
            if let Some(Value::Array(items)) = obj.get_mut(key) {
                items.iter_mut().for_each(normalize_step_tag);
            }
        }
        let document: WorkflowDocument = serde_json::from_value(value)
            .map_err(|e| WorkflowError::InvalidDocument(e.to_string()))?;
        document.validate()?;
        Ok(document)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| WorkflowError::InvalidDocument(e.to_string()))?;
        Self::from_json(value)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let document = Self::parse(&text)?;
        debug!(
            path = %path.as_ref().display(),
            steps = document.steps.len(),
            "loaded workflow document"
        );
        Ok(document)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        info!("✅ Workflow '{}' saved to {}", self.name, path.display());
        Ok(())
    }

    /// Structural checks that do not depend on inputs or a registry.
    pub fn validate(&self) -> Result<()> {
        if self.input_schema.schema_type != "object" {
            return Err(WorkflowError::InvalidDocument(format!(
                "inputSchema.type must be 'object', got '{}'",
                self.input_schema.schema_type
            )));
        }
        for name in &self.input_schema.required {
            if !self.input_schema.properties.contains_key(name) {
                return Err(WorkflowError::InvalidDocument(format!(
                    "required input '{name}' is not declared in properties"
                )));
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                StepSpec::Deterministic { action, .. } if action.trim().is_empty() => {
                    return Err(WorkflowError::InvalidDocument(format!(
                        "step {} has an empty action",
                        index + 1
                    )));
                }
                StepSpec::Agent { task, .. } if task.trim().is_empty() => {
                    return Err(WorkflowError::InvalidDocument(format!(
                        "step {} has an empty task",
                        index + 1
                    )));
                }
                StepSpec::Agent {
                    max_steps: Some(0),
                    ..
                }
                | StepSpec::Deterministic {
                    max_steps: Some(0),
                    ..
                } => {
                    return Err(WorkflowError::InvalidDocument(format!(
                        "step {} has maxSteps of 0",
                        index + 1
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject missing required inputs, undeclared inputs and type mismatches.
    pub fn validate_inputs(&self, inputs: &Map<String, Value>) -> Result<()> {
        let schema = &self.input_schema;
        let missing: Vec<&str> = schema
            .required
            .iter()
            .filter(|name| inputs.get(*name).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(WorkflowError::InvalidInputs(format!(
                "missing required inputs: {}",
                missing.join(", ")
            )));
        }
        for (name, value) in inputs {
            let Some(property) = schema.properties.get(name) else {
                return Err(WorkflowError::InvalidInputs(format!(
                    "unexpected input '{name}'"
                )));
            };
            if value.is_null() {
                continue;
            }
            if !property.kind.accepts(value) {
                return Err(WorkflowError::InvalidInputs(format!(
                    "input '{name}' must be a {}, got {value}",
                    property.kind.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Every deterministic step must name an action the registry knows.
    pub fn check_actions(&self, registry: &ActionRegistry) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if let StepSpec::Deterministic { action, .. } = step {
                if !registry.contains(action) {
                    return Err(WorkflowError::UnknownAction {
                        step: index + 1,
                        action: action.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Distinct placeholder names used anywhere in the steps, sorted.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.iter().flat_map(StepSpec::placeholders).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Keys of a legacy step that describe the step rather than its params.
const STEP_KEYS: [&str; 3] = ["description", "maxSteps", "max_steps"];

fn normalize_step_tag(step: &mut Value) {
    let Some(obj) = step.as_object_mut() else {
        return;
    };
    if obj.contains_key("kind") {
        return;
    }
    let Some(tag) = obj.remove("type") else {
        return;
    };
    match tag.as_str() {
        Some("deterministic") | Some("agent") => {
            obj.insert("kind".into(), tag);
        }
        Some(action) => {
            let action = action.to_string();
            if !obj.contains_key("params") {
                let params: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| !STEP_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                obj.retain(|k, _| STEP_KEYS.contains(&k.as_str()));
                obj.insert("params".into(), Value::Object(params));
            }
            obj.insert("kind".into(), Value::String("deterministic".into()));
            obj.insert("action".into(), Value::String(action));
        }
        None => {
            obj.insert("type".into(), tag);
        }
    }
}
