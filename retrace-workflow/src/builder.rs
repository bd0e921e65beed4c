//! Turning recordings into workflow documents.

use async_trait::async_trait;
use retrace::ActionRegistry;
use retrace_recorder::{
    normalizer::DEFAULT_MAX_IMAGES, prepare_builder_material, BuilderMaterial, CaptureEvent,
    RecordingFile, Step, StepKind,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::{
    document::{StepSpec, WorkflowDocument},
    placeholders, Result, WorkflowError,
};

pub const DETERMINISTIC_NAME: &str = "Deterministic Workflow from Recording";
pub const DETERMINISTIC_DESCRIPTION: &str =
    "Workflow generated directly from session recording with no input parameters.";

/// Everything a builder may use besides the recording itself.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// What the user wants the workflow to accomplish, if stated.
    pub goal: Option<String>,
    /// Markdown listing of the actions a deterministic step may name.
    pub available_actions: String,
    /// Raw capture events with screenshots set aside.
    pub material: BuilderMaterial,
}

impl BuildRequest {
    pub fn new(registry: &ActionRegistry) -> Self {
        Self {
            goal: None,
            available_actions: registry.describe_markdown(),
            material: BuilderMaterial::default(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_events(mut self, events: &[CaptureEvent], include_images: bool) -> Self {
        self.material = prepare_builder_material(events, include_images, DEFAULT_MAX_IMAGES);
        self
    }
}

/// Produces a [`WorkflowDocument`] from a recording. Implementations backed
/// by a language model live outside this crate.
#[async_trait]
pub trait WorkflowBuilder: Send + Sync {
    async fn build(
        &self,
        recording: &RecordingFile,
        request: &BuildRequest,
    ) -> Result<WorkflowDocument>;
}

/// One deterministic step per recorded step, no inputs.
#[derive(Debug, Clone)]
pub struct DeterministicBuilder {
    name: Option<String>,
    description: Option<String>,
}

impl Default for DeterministicBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            description: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn to_document(&self, steps: &[Step]) -> WorkflowDocument {
        let mut document = WorkflowDocument::new(
            self.name.as_deref().unwrap_or(DETERMINISTIC_NAME),
            self.description
                .as_deref()
                .unwrap_or(DETERMINISTIC_DESCRIPTION),
        );
        document.steps = steps.iter().map(step_spec).collect();
        document
    }
}

#[async_trait]
impl WorkflowBuilder for DeterministicBuilder {
    async fn build(
        &self,
        recording: &RecordingFile,
        request: &BuildRequest,
    ) -> Result<WorkflowDocument> {
        if recording.steps.is_empty() {
            return Err(WorkflowError::InvalidDocument(format!(
                "recording '{}' has no steps",
                recording.name
            )));
        }
        if let Some(goal) = &request.goal {
            debug!(goal, "deterministic builder ignores the goal");
        }
        if !request.material.events.is_empty() {
            debug!(
                events = request.material.events.len(),
                images = request.material.attachments.len(),
                "deterministic builder ignores the capture log"
            );
        }
        let document = self.to_document(&recording.steps);
        info!(
            "🛠️ Built deterministic workflow '{}' with {} steps",
            document.name,
            document.steps.len()
        );
        Ok(document)
    }
}

/// Recorded strings are replayed verbatim, so placeholder-shaped text in them
/// is escaped.
fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => (name, Value::String(placeholders::escape(&s))),
                other => (name, other),
            })
            .collect(),
        _ => Map::new(),
    }
}

/// The deterministic step that replays one recorded step. Recorded text that
/// looks like a `{{placeholder}}` stays literal.
pub fn step_spec(step: &Step) -> StepSpec {
    let (action, params, description) = match &step.kind {
        StepKind::Navigation => (
            "navigate",
            params(json!({ "url": step.url })),
            format!("Open URL {}", step.url),
        ),
        StepKind::Click { selector, .. } => (
            "click",
            params(json!({ "selector": selector })),
            format!("Click element {selector}"),
        ),
        StepKind::Input { selector, value } => (
            "input",
            params(json!({ "selector": selector, "text": value })),
            format!("Input text into {selector}"),
        ),
        StepKind::SelectChange {
            selector,
            selected_text,
            ..
        } => (
            "selectChange",
            params(json!({ "selector": selector, "text": selected_text })),
            format!("Select option '{selected_text}' in dropdown {selector}"),
        ),
        StepKind::KeyPress { selector, key } => (
            "keyPress",
            params(json!({ "selector": selector, "key": key })),
            format!("Press key '{key}' on element {selector}"),
        ),
        StepKind::Scroll { scroll_x, scroll_y } => (
            "scroll",
            params(json!({ "deltaX": scroll_x, "deltaY": scroll_y })),
            format!("Scroll page by (x={scroll_x}, y={scroll_y})"),
        ),
    };
    StepSpec::deterministic(action, params, placeholders::escape(&description))
}
