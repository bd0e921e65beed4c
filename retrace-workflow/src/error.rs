use retrace::AutomationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Unresolved placeholders: {}", .0.join(", "))]
    UnresolvedPlaceholders(Vec<String>),

    #[error("Invalid workflow inputs: {0}")]
    InvalidInputs(String),

    #[error("Step {step} uses unknown action '{action}'")]
    UnknownAction { step: usize, action: String },

    #[error("Step {step} has invalid params: {reason}")]
    InvalidParams { step: usize, reason: String },

    #[error("Invalid workflow document: {0}")]
    InvalidDocument(String),

    #[error("Workflow run cancelled")]
    Cancelled,

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
