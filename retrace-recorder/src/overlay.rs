//! Host-side view of the in-page capture overlay.
//!
//! The overlay is a peer reached through [`Page::evaluate`]: the host sends it
//! [`OverlayCommand`]s and it reports back through bridge events.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use retrace::Page;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{RecorderError, Result};

const EMBEDDED_OVERLAY: &str = include_str!("../assets/overlay.js");

/// Installs the function the overlay calls to reach the host. Safe to run on
/// every page load; an existing registration is left in place.
const REGISTER_SCRIPT: &str = r#"(() => {
  if (typeof window.__retraceNotify === 'function') return false;
  window.__retraceNotify = (eventType, payload) => {
    window.postMessage({ source: 'retrace-overlay', eventType, payload: payload ?? null }, '*');
  };
  return true;
})()"#;

const STATUS_SCRIPT: &str = r#"(() => {
  const o = window.RetraceOverlay;
  if (!o || typeof o.getStatus !== 'function') return null;
  return o.getStatus();
})()"#;

/// Source of the overlay script, resolved once when a session is configured.
#[derive(Debug, Clone)]
pub struct OverlayScript {
    source: Arc<str>,
}

impl Default for OverlayScript {
    fn default() -> Self {
        Self::embedded()
    }
}

impl OverlayScript {
    pub fn embedded() -> Self {
        Self::from_source(EMBEDDED_OVERLAY)
    }

    pub fn from_source(source: impl Into<Arc<str>>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::Transport(format!(
                "failed to read overlay script {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self::from_source(source))
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Text,
    Radio,
}

/// A question shown in the overlay; answered by one `submitOverlayInput`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub mode: InputMode,
    pub question: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub choices: Vec<String>,
}

impl InputRequest {
    pub fn text(question: impl Into<String>) -> Self {
        Self {
            mode: InputMode::Text,
            question: question.into(),
            placeholder: String::new(),
            choices: Vec::new(),
        }
    }

    pub fn radio(question: impl Into<String>, choices: Vec<String>) -> Self {
        Self {
            mode: InputMode::Radio,
            question: question.into(),
            placeholder: String::new(),
            choices,
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }
}

/// Host-to-overlay calls.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayCommand {
    SetRecording(bool),
    RequestOutput(String),
    RequestInput(InputRequest),
    AddWorkflowStep {
        action_label: String,
        selector: Option<String>,
    },
    RefreshListeners,
    ClearWorkflowSteps,
}

impl OverlayCommand {
    pub fn method(&self) -> &'static str {
        match self {
            OverlayCommand::SetRecording(_) => "setRecording",
            OverlayCommand::RequestOutput(_) => "requestOutput",
            OverlayCommand::RequestInput(_) => "requestInput",
            OverlayCommand::AddWorkflowStep { .. } => "addWorkflowStep",
            OverlayCommand::RefreshListeners => "refreshListeners",
            OverlayCommand::ClearWorkflowSteps => "clearWorkflowSteps",
        }
    }

    fn args(&self) -> Result<Vec<Value>> {
        Ok(match self {
            OverlayCommand::SetRecording(on) => vec![Value::Bool(*on)],
            OverlayCommand::RequestOutput(message) => vec![Value::String(message.clone())],
            OverlayCommand::RequestInput(request) => vec![serde_json::to_value(request)?],
            OverlayCommand::AddWorkflowStep {
                action_label,
                selector,
            } => vec![
                Value::String(action_label.clone()),
                selector.clone().map(Value::String).unwrap_or(Value::Null),
            ],
            OverlayCommand::RefreshListeners | OverlayCommand::ClearWorkflowSteps => Vec::new(),
        })
    }

    /// Script invoking the command on `window.RetraceOverlay`.
    pub fn to_script(&self) -> Result<String> {
        let args = self
            .args()?
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "(() => {{ const o = window.RetraceOverlay; if (!o) return false; o.{}({}); return true; }})()",
            self.method(),
            args
        ))
    }
}

/// Status reported by the overlay's `getStatus()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OverlayStatus {
    #[serde(default)]
    pub mounted: bool,
    #[serde(default)]
    pub recording: bool,
}

#[async_trait]
pub trait Overlay: Send + Sync {
    /// Whether the overlay UI is mounted in the current document.
    async fn is_present(&self) -> Result<bool>;

    /// Inject the overlay script into the current document.
    async fn inject(&self, recording: bool) -> Result<()>;

    /// Make sure the overlay can reach the host. Idempotent.
    async fn ensure_registered(&self) -> Result<()>;

    async fn send(&self, command: &OverlayCommand) -> Result<()>;
}

/// [`Overlay`] implemented by evaluating scripts in a [`Page`].
pub struct PageOverlay {
    page: Arc<dyn Page>,
    script: OverlayScript,
}

impl PageOverlay {
    pub fn new(page: Arc<dyn Page>, script: OverlayScript) -> Self {
        Self { page, script }
    }

    fn transport(e: retrace::AutomationError) -> RecorderError {
        RecorderError::Transport(e.to_string())
    }
}

#[async_trait]
impl Overlay for PageOverlay {
    async fn is_present(&self) -> Result<bool> {
        let status = self
            .page
            .evaluate(STATUS_SCRIPT)
            .await
            .map_err(Self::transport)?;
        if status.is_null() {
            return Ok(false);
        }
        let status: OverlayStatus = serde_json::from_value(status)?;
        Ok(status.mounted)
    }

    async fn inject(&self, recording: bool) -> Result<()> {
        let script = format!(
            "(() => {{\n{}\n;window.RetraceOverlay && window.RetraceOverlay.mount({recording}); return true; }})()",
            self.script.source()
        );
        self.page
            .evaluate(&script)
            .await
            .map_err(Self::transport)?;
        if !self.is_present().await? {
            return Err(RecorderError::Transport(
                "overlay did not mount after injection".into(),
            ));
        }
        Ok(())
    }

    async fn ensure_registered(&self) -> Result<()> {
        let installed = self
            .page
            .evaluate(REGISTER_SCRIPT)
            .await
            .map_err(Self::transport)?;
        if installed == Value::Bool(true) {
            debug!("[🔗] Registered overlay bridge function");
        }
        Ok(())
    }

    async fn send(&self, command: &OverlayCommand) -> Result<()> {
        let script = command.to_script()?;
        let delivered = self
            .page
            .evaluate(&script)
            .await
            .map_err(Self::transport)?;
        if delivered == Value::Bool(false) {
            return Err(RecorderError::Transport(format!(
                "overlay missing, '{}' not delivered",
                command.method()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_scripts_quote_arguments() {
        let script = OverlayCommand::RequestOutput("it's \"done\"".into())
            .to_script()
            .unwrap();
        assert!(script.contains(r#"o.requestOutput("it's \"done\"")"#));

        let script = OverlayCommand::AddWorkflowStep {
            action_label: "navigation".into(),
            selector: None,
        }
        .to_script()
        .unwrap();
        assert!(script.contains(r#"o.addWorkflowStep("navigation", null)"#));
    }

    #[test]
    fn test_input_request_wire_shape() {
        let request = InputRequest::radio("Pick one", vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["mode"], "radio");
        assert_eq!(value["choices"][1], "b");
    }

    #[test]
    fn test_embedded_script_exposes_api() {
        let script = OverlayScript::default();
        for method in [
            "setRecording",
            "requestOutput",
            "requestInput",
            "addWorkflowStep",
            "refreshListeners",
            "clearWorkflowSteps",
            "getStatus",
            "mount",
        ] {
            assert!(script.source().contains(method), "overlay lacks {method}");
        }
    }
}
