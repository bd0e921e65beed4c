use std::sync::Arc;

use retrace::{ActionConfig, ActionRegistry, AutomationError, BrowserAction, Page, PageProvider};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    actor::{AutonomousActor, InputResolver, NoActor, PromptInputResolver},
    document::{StepSpec, WorkflowDocument},
    report::{ReplayReport, StepReport, StepStatus},
    Result, WorkflowError,
};

pub const DEFAULT_MAX_STEPS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Hand a failed deterministic step to the actor instead of aborting.
    pub fallback_to_actor: bool,
    /// Actor step budget when a step does not set `maxSteps`.
    pub default_max_steps: u32,
    pub action: ActionConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            fallback_to_actor: true,
            default_max_steps: DEFAULT_MAX_STEPS,
            action: ActionConfig::default(),
        }
    }
}

/// A step whose placeholders are resolved and whose action, if any, is
/// validated.
#[derive(Debug, Clone)]
enum PreparedStep {
    Deterministic {
        spec: StepSpec,
        action: BrowserAction,
    },
    Agent {
        spec: StepSpec,
        task: String,
    },
}

impl PreparedStep {
    fn spec(&self) -> &StepSpec {
        match self {
            PreparedStep::Deterministic { spec, .. } | PreparedStep::Agent { spec, .. } => spec,
        }
    }
}

/// Runs workflow documents against pages from a [`PageProvider`].
pub struct ReplayEngine {
    provider: Arc<dyn PageProvider>,
    registry: ActionRegistry,
    actor: Arc<dyn AutonomousActor>,
    resolver: Arc<dyn InputResolver>,
    config: ReplayConfig,
    cancellation: CancellationToken,
}

impl ReplayEngine {
    pub fn new(provider: Arc<dyn PageProvider>, config: ReplayConfig) -> Self {
        Self {
            provider,
            registry: ActionRegistry::new(config.action.clone()),
            actor: Arc::new(NoActor),
            resolver: Arc::new(PromptInputResolver),
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_actor(mut self, actor: Arc<dyn AutonomousActor>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use an externally owned token, e.g. one cancelled on Ctrl-C.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Cancelling stops the step in progress and any later steps or runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Derive inputs from `prompt`, then run as [`Self::run_with_inputs`].
    #[instrument(skip(self, document, prompt), fields(workflow = %document.name))]
    pub async fn run_as_tool(
        &self,
        document: &WorkflowDocument,
        prompt: &str,
    ) -> Result<ReplayReport> {
        let inputs = self.resolver.resolve(document, prompt).await?;
        self.run_with_inputs(document, inputs).await
    }

    /// Replay `document`. Configuration problems (inputs, placeholders,
    /// unknown actions, bad params) are returned as errors before a page is
    /// opened; everything that happens on the page ends up in the report.
    #[instrument(skip(self, document, inputs), fields(workflow = %document.name))]
    pub async fn run_with_inputs(
        &self,
        document: &WorkflowDocument,
        inputs: Map<String, Value>,
    ) -> Result<ReplayReport> {
        let steps = self.prepare(document, inputs)?;
        if self.cancellation.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        let page = self.provider.open_page().await?;
        let report = self.execute(document, &steps, page.as_ref()).await;
        if let Err(e) = page.close().await {
            warn!("Failed to release page after replay: {}", e);
        }

        if report.success {
            info!("✅ {}", report.summary());
        } else {
            error!("❌ {}", report.summary());
        }
        Ok(report)
    }

    fn prepare(
        &self,
        document: &WorkflowDocument,
        inputs: Map<String, Value>,
    ) -> Result<Vec<PreparedStep>> {
        document.validate()?;
        document.validate_inputs(&inputs)?;
        document.check_actions(&self.registry)?;

        let inputs = Value::Object(inputs);
        let mut unresolved = Vec::new();
        let mut resolved = Vec::with_capacity(document.steps.len());
        for step in &document.steps {
            let spec = match step {
                StepSpec::Deterministic { action, .. } => self.registry.spec(action),
                StepSpec::Agent { .. } => None,
            };
            let substitution = step.resolve_for(&inputs, spec);
            unresolved.extend(substitution.unresolved);
            resolved.push(substitution.value);
        }
        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            return Err(WorkflowError::UnresolvedPlaceholders(unresolved));
        }

        resolved
            .into_iter()
            .enumerate()
            .map(|(index, spec)| match &spec {
                StepSpec::Deterministic { action, params, .. } => {
                    let action = self
                        .registry
                        .validate(action, &Value::Object(params.clone()))
                        .map_err(|e| WorkflowError::InvalidParams {
                            step: index + 1,
                            reason: e.to_string(),
                        })?;
                    Ok(PreparedStep::Deterministic {
                        spec: spec.clone(),
                        action,
                    })
                }
                StepSpec::Agent { task, .. } => Ok(PreparedStep::Agent {
                    task: task.clone(),
                    spec: spec.clone(),
                }),
            })
            .collect()
    }

    async fn execute(
        &self,
        document: &WorkflowDocument,
        steps: &[PreparedStep],
        page: &dyn Page,
    ) -> ReplayReport {
        let started_at = chrono::Local::now().to_rfc3339();
        let run_started = Instant::now();
        let total = steps.len();
        let mut reports = Vec::with_capacity(total);
        let mut cancelled = false;

        info!(
            "▶️ Replaying workflow '{}' ({} steps)",
            document.name, total
        );

        for (index, step) in steps.iter().enumerate() {
            let number = index + 1;
            if self.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            info!("➡️ Step {}/{}: {}", number, total, step.spec().title());

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => None,
                report = self.run_step(number, step, page) => Some(report),
            };
            let report = match outcome {
                Some(report) => report,
                None => {
                    warn!("⏹️ Step {} cancelled", number);
                    cancelled = true;
                    let interrupted =
                        AutomationError::Cancelled(format!("step {number} interrupted"));
                    StepReport {
                        step: number,
                        kind: step.spec().kind_label().to_string(),
                        title: step.spec().title(),
                        status: StepStatus::Cancelled,
                        duration_ms: elapsed_ms(started),
                        message: None,
                        error: Some(interrupted.to_string()),
                        error_kind: Some(interrupted.kind().to_string()),
                        actor: None,
                    }
                }
            };
            let stop = !report.status.is_success();
            reports.push(report);
            if stop {
                break;
            }
        }

        let failure = reports.iter().find(|r| !r.status.is_success());
        let failed_step = failure.map(|r| r.step);
        let error = failure.and_then(|r| r.error.clone());
        let success = !cancelled && failure.is_none() && reports.len() == total;

        ReplayReport {
            workflow: document.name.clone(),
            success,
            cancelled,
            started_at,
            duration_ms: elapsed_ms(run_started),
            steps: reports,
            failed_step,
            error,
        }
    }

    async fn run_step(&self, number: usize, step: &PreparedStep, page: &dyn Page) -> StepReport {
        let started = Instant::now();
        let spec = step.spec();
        let mut report = StepReport {
            step: number,
            kind: spec.kind_label().to_string(),
            title: spec.title(),
            status: StepStatus::Failed,
            duration_ms: 0,
            message: None,
            error: None,
            error_kind: None,
            actor: None,
        };
        let max_steps = spec.max_steps().unwrap_or(self.config.default_max_steps);

        match step {
            PreparedStep::Deterministic { action, .. } => {
                match self.registry.run(page, action).await {
                    Ok(outcome) => {
                        report.status = StepStatus::Deterministic;
                        report.message = Some(outcome.message);
                    }
                    Err(e) if self.config.fallback_to_actor && e.is_execution_failure() => {
                        warn!(
                            "🤖 Step {} failed ({}), handing over to the autonomous actor",
                            number, e
                        );
                        let task = fallback_task(spec, action, &e);
                        match self.actor.attempt(&task, page, max_steps).await {
                            Ok(outcome) if outcome.success => {
                                info!("🤖 Actor recovered step {}: {}", number, outcome.summary);
                                report.status = StepStatus::RecoveredByActor;
                                report.message = Some(outcome.summary.clone());
                                report.actor = Some(outcome);
                            }
                            Ok(outcome) => {
                                report.error =
                                    Some(format!("{e}; actor gave up: {}", outcome.summary));
                                report.error_kind = Some(e.kind().to_string());
                                report.actor = Some(outcome);
                            }
                            Err(actor_err) => {
                                report.error = Some(format!("{e}; actor failed: {actor_err}"));
                                report.error_kind = Some(e.kind().to_string());
                            }
                        }
                    }
                    Err(e) => {
                        report.error = Some(e.to_string());
                        report.error_kind = Some(e.kind().to_string());
                    }
                }
            }
            PreparedStep::Agent { task, .. } => {
                match self.actor.attempt(task, page, max_steps).await {
                    Ok(outcome) if outcome.success => {
                        info!("🤖 Agent step {} done: {}", number, outcome.summary);
                        report.status = StepStatus::Agent;
                        report.message = Some(outcome.summary.clone());
                        report.actor = Some(outcome);
                    }
                    Ok(outcome) => {
                        report.error = Some(format!("actor gave up: {}", outcome.summary));
                        report.actor = Some(outcome);
                    }
                    Err(e) => {
                        report.error = Some(format!("actor failed: {e}"));
                        report.error_kind = Some(e.kind().to_string());
                    }
                }
            }
        }

        report.duration_ms = elapsed_ms(started);
        if !report.status.is_success() {
            warn!(
                "Step {} failed: {}",
                number,
                report.error.as_deref().unwrap_or_default()
            );
        }
        report
    }
}

/// Task handed to the actor when a deterministic step fails.
fn fallback_task(spec: &StepSpec, action: &BrowserAction, error: &AutomationError) -> String {
    let goal = match spec.description() {
        "" => format!("Perform the browser action {action}"),
        description => description.to_string(),
    };
    format!("{goal}. The scripted attempt failed with: {error}. Complete this single step on the current page.")
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
