//! Workflow documents and their replay
//!
//! A [`WorkflowDocument`] is an ordered list of deterministic steps (named
//! actions from [`retrace::ActionRegistry`]) and agent steps (tasks for an
//! [`AutonomousActor`]). The [`ReplayEngine`] runs one against a page,
//! substituting `{{input}}` placeholders first and handing failed
//! deterministic steps to the actor when fallback is enabled.

pub mod actor;
pub mod builder;
pub mod document;
pub mod engine;
pub mod error;
pub mod placeholders;
pub mod report;

pub use actor::{ActorOutcome, AutonomousActor, InputResolver, NoActor, PromptInputResolver};
pub use builder::{BuildRequest, DeterministicBuilder, WorkflowBuilder};
pub use document::{InputProperty, InputSchema, InputType, StepSpec, WorkflowDocument};
pub use engine::{ReplayConfig, ReplayEngine, DEFAULT_MAX_STEPS};
pub use error::{Result, WorkflowError};
pub use report::{ReplayReport, StepReport, StepStatus};
