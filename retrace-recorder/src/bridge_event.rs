use serde::Deserialize;
use serde_json::Value;

use crate::{
    events::{CaptureEvent, StepExpectation},
    RecorderError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Finish,
    Update,
    Back,
    Close,
}

/// A typed overlay-to-host event.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Control(ControlAction),
    SubmitOverlayInput(String),
    /// `elementClick`, `elementInput`, `elementChange`, `keydownEvent` and
    /// `navigation`, already mapped to a raw capture event.
    Capture(CaptureEvent),
    DeleteStep {
        index: usize,
    },
    ReorderSteps {
        original_index: usize,
        new_index: usize,
        expected: StepExpectation,
    },
    Ping,
}

#[derive(Deserialize)]
struct ControlPayload {
    action: ControlAction,
}

#[derive(Deserialize)]
struct DeletePayload {
    index: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderPayload {
    original_index: usize,
    new_index: usize,
    #[serde(alias = "expectedActionAndSelector")]
    expected: StepExpectation,
}

fn protocol(event_type: &str, e: impl std::fmt::Display) -> RecorderError {
    RecorderError::Protocol(format!("malformed '{event_type}' payload: {e}"))
}

impl BridgeEvent {
    pub fn parse(event_type: &str, payload: Value) -> Result<Self> {
        let capture_type = match event_type {
            "elementClick" => Some("click"),
            "elementInput" => Some("input"),
            "elementChange" => Some("select_change"),
            "keydownEvent" => Some("key_press"),
            "navigation" => Some("navigation"),
            _ => None,
        };
        if let Some(capture_type) = capture_type {
            let mut map = match payload {
                Value::Object(map) => map,
                Value::Null => serde_json::Map::new(),
                other => return Err(protocol(event_type, format!("expected object, got {other}"))),
            };
            map.insert("type".into(), Value::String(capture_type.into()));
            let event = serde_json::from_value(Value::Object(map))
                .map_err(|e| protocol(event_type, e))?;
            return Ok(BridgeEvent::Capture(event));
        }

        match event_type {
            "control" => {
                let p: ControlPayload =
                    serde_json::from_value(payload).map_err(|e| protocol(event_type, e))?;
                Ok(BridgeEvent::Control(p.action))
            }
            "submitOverlayInput" => {
                let value = match payload {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    Value::Object(mut map) => match map.remove("value") {
                        Some(Value::String(s)) => s,
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    },
                    other => other.to_string(),
                };
                Ok(BridgeEvent::SubmitOverlayInput(value))
            }
            "deleteStep" => {
                let index = match payload {
                    Value::Number(n) => n
                        .as_u64()
                        .map(|i| i as usize)
                        .ok_or_else(|| protocol(event_type, "index must be a non-negative integer"))?,
                    other => {
                        serde_json::from_value::<DeletePayload>(other)
                            .map_err(|e| protocol(event_type, e))?
                            .index
                    }
                };
                Ok(BridgeEvent::DeleteStep { index })
            }
            "reorderSteps" => {
                let p: ReorderPayload =
                    serde_json::from_value(payload).map_err(|e| protocol(event_type, e))?;
                Ok(BridgeEvent::ReorderSteps {
                    original_index: p.original_index,
                    new_index: p.new_index,
                    expected: p.expected,
                })
            }
            "ping" => Ok(BridgeEvent::Ping),
            other => Err(RecorderError::Protocol(format!(
                "unknown bridge event '{other}'"
            ))),
        }
    }

    /// Events handled even when the session is not recording.
    pub fn allowed_while_idle(&self) -> bool {
        matches!(
            self,
            BridgeEvent::Control(_) | BridgeEvent::SubmitOverlayInput(_) | BridgeEvent::Ping
        )
    }
}
