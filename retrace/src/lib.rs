//! Browser page automation for recorded workflows
//!
//! This crate holds the pieces shared by recording and replay: the [`Page`]
//! abstraction, a WebSocket bridge to a browser extension that implements it,
//! and the registry of deterministic actions a workflow step can name.

pub mod actions;
pub mod bridge_page;
pub mod dom;
pub mod errors;
pub mod extension_bridge;
pub mod page;

pub use actions::{ActionConfig, ActionOutcome, ActionRegistry, ActionSpec, BrowserAction};
pub use bridge_page::{BridgePage, BridgePageProvider};
pub use errors::AutomationError;
pub use extension_bridge::{BridgeConfig, ExtensionBridge, PeerSignal};
pub use page::{Page, PageProvider};
