//! Turns raw [`CaptureEvent`]s into canonical [`Step`]s.
//!
//! The same [`Normalizer`] drives the live recording session (one event at a
//! time) and the batch path used on saved capture logs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    events::{CaptureEvent, CaptureKind, Step, StepKind, StepList},
    RecorderError, Result,
};

/// Upper bound on screenshots attached for a workflow builder.
pub const DEFAULT_MAX_IMAGES: usize = 100;

/// What happened to one ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// A new step was appended at this 0-based index.
    Appended(usize),
    /// The value of the pending input step at this index was replaced.
    Merged(usize),
    Dropped,
}

/// Stateful event-to-step converter.
///
/// An `input` event targeting the selector of the pending input step replaces
/// its value instead of appending. Every event of another type, including ones
/// that produce no step, flushes the pending input.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    /// Drop navigation events whose URL equals the last recorded URL.
    pub dedupe_navigation: bool,
    pending_input: bool,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            dedupe_navigation: true,
            pending_input: false,
        }
    }

    /// Whether the next same-selector `input` event merges into the last step.
    pub fn has_pending_input(&self) -> bool {
        self.pending_input
    }

    /// End the current input run, e.g. after the step list was edited.
    pub fn flush(&mut self) {
        self.pending_input = false;
    }

    pub fn ingest(&mut self, event: &CaptureEvent, steps: &mut StepList) -> Ingested {
        if event.kind() != Some(CaptureKind::Input) {
            self.flush();
        }
        let Some(kind) = to_step_kind(event) else {
            return Ingested::Dropped;
        };

        if let StepKind::Input { selector, value } = &kind {
            let index = steps.len().saturating_sub(1);
            if self.pending_input {
                if let Some(last) = steps.last_mut() {
                    if let StepKind::Input {
                        selector: last_selector,
                        value: last_value,
                    } = &mut last.kind
                    {
                        if last_selector == selector {
                            *last_value = value.clone();
                            last.timestamp = event.timestamp;
                            return Ingested::Merged(index);
                        }
                    }
                }
            }
            steps.push(Step::new(event.timestamp, event.url.clone(), kind));
            self.pending_input = true;
            return Ingested::Appended(steps.len() - 1);
        }

        if matches!(kind, StepKind::Navigation)
            && self.dedupe_navigation
            && steps.last_url() == Some(event.url.as_str())
        {
            debug!(url = %event.url, "navigation to the current URL, skipping");
            return Ingested::Dropped;
        }

        steps.push(Step::new(event.timestamp, event.url.clone(), kind));
        Ingested::Appended(steps.len() - 1)
    }
}

/// Map one raw event onto a step body, or `None` when it carries no step.
pub fn to_step_kind(event: &CaptureEvent) -> Option<StepKind> {
    let Some(kind) = event.kind() else {
        warn!(event_type = %event.event_type, "Unknown capture event type, dropping");
        return None;
    };
    let selector = event.selector().map(str::to_string);
    let missing = |what: &str| {
        debug!(
            event_type = %event.event_type,
            timestamp = event.timestamp,
            "Dropping event without {}", what
        );
    };

    match kind {
        CaptureKind::Navigation => {
            if event.url.is_empty() {
                missing("url");
                return None;
            }
            Some(StepKind::Navigation)
        }
        CaptureKind::Click => match selector {
            Some(selector) => Some(StepKind::Click {
                selector,
                element_tag: event.element_tag.clone(),
                element_text: event.element_text.clone(),
            }),
            None => {
                missing("selector");
                None
            }
        },
        CaptureKind::Input => match (selector, event.value.clone()) {
            (Some(selector), Some(value)) => Some(StepKind::Input { selector, value }),
            (None, _) => {
                missing("selector");
                None
            }
            (_, None) => {
                missing("value");
                None
            }
        },
        CaptureKind::SelectChange => {
            let text = event
                .selected_text
                .clone()
                .filter(|t| !t.is_empty())
                .or_else(|| event.selected_value.clone());
            match (selector, text) {
                (Some(selector), Some(selected_text)) => Some(StepKind::SelectChange {
                    selector,
                    selected_value: event.selected_value.clone(),
                    selected_text,
                }),
                _ => {
                    missing("selector or option");
                    None
                }
            }
        }
        CaptureKind::KeyPress => match (selector, event.key.clone()) {
            (Some(selector), Some(key)) => Some(StepKind::KeyPress { selector, key }),
            _ => {
                missing("selector or key");
                None
            }
        },
        CaptureKind::Scroll => Some(StepKind::Scroll {
            scroll_x: event.scroll_x.unwrap_or(0.0).round() as i64,
            scroll_y: event.scroll_y.unwrap_or(0.0).round() as i64,
        }),
        CaptureKind::TabUpdated => None,
    }
}

/// Normalize a whole capture log: lead-trim, then convert with debounce.
pub fn normalize(events: &[CaptureEvent]) -> Vec<Step> {
    let trimmed = trim_lead(events);
    let mut normalizer = Normalizer::new();
    let mut steps = StepList::new();
    for event in &trimmed {
        normalizer.ingest(event, &mut steps);
    }
    steps.to_vec()
}

/// Drop navigation noise before the first genuine interaction and open with a
/// single navigation to the page that interaction happened in.
pub fn trim_lead(events: &[CaptureEvent]) -> Vec<CaptureEvent> {
    let Some(first) = events
        .iter()
        .position(|e| e.kind().is_some_and(CaptureKind::is_interaction))
    else {
        return events.to_vec();
    };

    let interaction = &events[first];
    let start_url = interaction
        .frame_url
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| interaction.url.clone());

    let mut out = Vec::with_capacity(events.len() + 1);
    if !start_url.is_empty() {
        out.push(CaptureEvent {
            event_type: "navigation".into(),
            timestamp: events[0].timestamp,
            url: start_url,
            ..Default::default()
        });
    }
    out.extend(
        events[..first]
            .iter()
            .filter(|e| {
                !matches!(
                    e.kind(),
                    Some(CaptureKind::Navigation) | Some(CaptureKind::TabUpdated)
                )
            })
            .cloned(),
    );
    out.extend(events[first..].iter().cloned());
    out
}

/// A screenshot kept aside for a workflow builder, keyed by `type@timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualAttachment {
    pub key: String,
    /// The originating event with its screenshot removed.
    pub event: CaptureEvent,
    /// Bare base64 PNG data; any `data:` URI prefix is stripped.
    pub image_base64: String,
}

/// Events and images prepared for a workflow builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderMaterial {
    pub events: Vec<CaptureEvent>,
    pub attachments: Vec<VisualAttachment>,
}

/// Prune screenshots from `events`, keeping up to `max_images` valid ones in a
/// side channel when `include_images` is set. Input events never carry an image.
pub fn prepare_builder_material(
    events: &[CaptureEvent],
    include_images: bool,
    max_images: usize,
) -> BuilderMaterial {
    let mut material = BuilderMaterial::default();
    for event in events {
        let mut pruned = event.clone();
        let screenshot = pruned.screenshot.take();
        if include_images
            && material.attachments.len() < max_images
            && event.kind() != Some(CaptureKind::Input)
        {
            if let Some(raw) = screenshot.filter(|s| !s.is_empty()) {
                let data = match raw.split_once(',') {
                    Some((prefix, data)) if prefix.starts_with("data:") => data.to_string(),
                    _ => raw,
                };
                if STANDARD.decode(data.as_bytes()).is_ok() {
                    material.attachments.push(VisualAttachment {
                        key: format!("{}@{}", event.event_type, event.timestamp),
                        event: pruned.clone(),
                        image_base64: data,
                    });
                } else {
                    warn!(
                        "Invalid screenshot for event {} @ {}",
                        event.event_type, event.timestamp
                    );
                }
            }
        }
        material.events.push(pruned);
    }
    material
}

/// Parse a capture log stored either as a bare array or as `{"events": [...]}`.
/// Entries that do not parse as events are skipped.
pub fn parse_session(data: Value) -> Result<Vec<CaptureEvent>> {
    let raw = match data {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RecorderError::Protocol(
                    "capture log object has no \"events\" array".into(),
                ))
            }
        },
        other => {
            return Err(RecorderError::Protocol(format!(
                "capture log must be an array or an object, got {other}"
            )))
        }
    };

    let mut events = Vec::with_capacity(raw.len());
    for item in raw {
        match serde_json::from_value::<CaptureEvent>(item) {
            Ok(event) => events.push(event),
            Err(e) => warn!("[normalizer] Skipping event due to parse error: {}", e),
        }
    }
    Ok(events)
}
