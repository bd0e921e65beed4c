//! The page abstraction every deterministic action and the recording session
//! run against.
//!
//! Element operations are single-shot: a missing element is reported as
//! [`AutomationError::SelectorNotFound`] immediately and waiting is left to the
//! caller (see [`crate::actions::ActionRegistry`]).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::AutomationError;

#[async_trait]
pub trait Page: Send + Sync {
    /// URL of the document currently loaded.
    async fn url(&self) -> Result<String, AutomationError>;

    /// Navigate and wait for the new document to report that it loaded.
    async fn goto(&self, url: &str) -> Result<(), AutomationError>;

    /// Lower-cased tag name of the first element matching `selector`, or
    /// `None` when nothing matches.
    async fn element_tag(&self, selector: &str) -> Result<Option<String>, AutomationError>;

    /// Click the element. `force` skips the overlapping-element check.
    async fn click(&self, selector: &str, force: bool) -> Result<(), AutomationError>;

    /// Replace the value of a text-like control.
    async fn fill(&self, selector: &str, text: &str) -> Result<(), AutomationError>;

    /// Choose the `<option>` whose visible text equals `text`.
    async fn select_option_by_text(
        &self,
        selector: &str,
        text: &str,
    ) -> Result<(), AutomationError>;

    async fn press(&self, selector: &str, key: &str) -> Result<(), AutomationError>;

    async fn scroll_by(&self, delta_x: i64, delta_y: i64) -> Result<(), AutomationError>;

    /// Evaluate a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<Value, AutomationError>;

    /// Release the page. Implementations must tolerate repeated calls.
    async fn close(&self) -> Result<(), AutomationError>;
}

/// Hands out a fresh page for one recording session or replay run.
#[async_trait]
pub trait PageProvider: Send + Sync {
    async fn open_page(&self) -> Result<Arc<dyn Page>, AutomationError>;
}
