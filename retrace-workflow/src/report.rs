use serde::{Deserialize, Serialize};

use crate::actor::ActorOutcome;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The registered action succeeded.
    Deterministic,
    /// The action failed and the actor completed the step instead.
    RecoveredByActor,
    /// An agent step the actor completed.
    Agent,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StepStatus::Deterministic | StepStatus::RecoveredByActor | StepStatus::Agent
        )
    }
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    /// 1-based position in the document.
    pub step: usize,
    pub kind: String,
    pub title: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Label of the automation error behind `error`, e.g. `selector_not_found`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorOutcome>,
}

/// Result of one replay run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub workflow: String,
    /// True iff every step ran deterministically or was completed by the actor.
    pub success: bool,
    pub cancelled: bool,
    /// RFC 3339 start time.
    pub started_at: String,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
    /// The first step that could not be completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplayReport {
    pub fn first_failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| !s.status.is_success())
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_success()).count()
    }

    pub fn recovered_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::RecoveredByActor)
            .count()
    }

    /// One-line outcome for logs and the CLI.
    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "Workflow '{}' completed {} steps in {}ms ({} recovered by actor)",
                self.workflow,
                self.completed_steps(),
                self.duration_ms,
                self.recovered_steps()
            )
        } else if self.cancelled {
            format!(
                "Workflow '{}' cancelled after {} steps",
                self.workflow,
                self.completed_steps()
            )
        } else {
            format!(
                "Workflow '{}' failed at step {}: {}",
                self.workflow,
                self.failed_step.unwrap_or_default(),
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}
