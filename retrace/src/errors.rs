use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Page bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AutomationError {
    /// Short machine-readable label, reported as a replay step's `errorKind`.
    pub fn kind(&self) -> &'static str {
        match self {
            AutomationError::SelectorNotFound(_) => "selector_not_found",
            AutomationError::Timeout(_) => "timeout",
            AutomationError::PageError(_) => "page_error",
            AutomationError::InvalidArgument(_) => "invalid_argument",
            AutomationError::UnknownAction(_) => "unknown_action",
            AutomationError::BridgeUnavailable(_) => "bridge_unavailable",
            AutomationError::Cancelled(_) => "cancelled",
        }
    }

    /// Whether a deterministic step that failed this way may be retried by a
    /// fallback actor. Schema problems are configuration errors and never are.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            AutomationError::SelectorNotFound(_)
                | AutomationError::Timeout(_)
                | AutomationError::PageError(_)
                | AutomationError::BridgeUnavailable(_)
        )
    }
}
