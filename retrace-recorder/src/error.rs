use retrace::AutomationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Page transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to persist recording: {0}")]
    Persistence(String),

    #[error("An input request is already pending")]
    InputAlreadyPending,

    #[error("Recording session is closed")]
    SessionClosed,

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
