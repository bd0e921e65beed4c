//! The recording session: one page, one overlay, one ordered event inbox.
//!
//! All session state is owned by a single task that processes
//! [`SessionMessage`]s strictly in arrival order. Callers talk to it through a
//! cloneable [`SessionHandle`]. Interactive input requests do not block that
//! task: the reply channel is parked until a `submitOverlayInput` event (or
//! session close) resolves it.

use std::{path::PathBuf, sync::Arc, time::Duration};

use retrace::{Page, PageProvider, PeerSignal};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    bridge_event::{BridgeEvent, ControlAction},
    events::{CaptureEvent, CaptureKind, Step, StepKind, StepList},
    normalizer::{Ingested, Normalizer},
    overlay::{InputRequest, Overlay, OverlayCommand, OverlayScript, PageOverlay},
    storage::RecordingStore,
    RecorderError, Result,
};

/// Status lines kept for replay into a reinjected overlay.
pub const OVERLAY_LOG_LIMIT: usize = 200;

/// Configuration for a recording session.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Directory receiving finished recordings.
    pub output_dir: PathBuf,
    /// Written instead when `output_dir` cannot be written.
    pub fallback_path: PathBuf,
    pub workflow_name: String,
    pub description: String,
    pub overlay_script: OverlayScript,
    pub overlay_retry_attempts: u32,
    pub overlay_retry_delay: Duration,
    /// How often the overlay's presence is checked. Zero disables the check.
    pub monitor_interval: Duration,
    /// Ask for workflow name and description on start and after each finish.
    pub prompt_metadata: bool,
    /// Capacity of the inbox and of the session event broadcast.
    pub event_buffer: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            fallback_path: PathBuf::from("workflow_fallback.json"),
            workflow_name: "recording".to_string(),
            description: String::new(),
            overlay_script: OverlayScript::default(),
            overlay_retry_attempts: 3,
            overlay_retry_delay: Duration::from_millis(250),
            monitor_interval: Duration::from_secs(2),
            prompt_metadata: false,
            event_buffer: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Armed,
    Recording,
    Closed,
}

/// Broadcast to observers of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    PhaseChanged { phase: SessionPhase },
    /// A step was appended, or an input step took a newer value.
    StepRecorded { step: Step },
    StepsChanged { total: usize },
    Output { message: String },
    Saved { path: PathBuf },
    NothingToSave,
    Closed,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub steps: Vec<Step>,
    pub saved: bool,
    pub pending_input: Option<InputRequest>,
    pub overlay_log: Vec<String>,
    pub workflow_name: String,
    pub description: String,
    pub last_saved: Option<PathBuf>,
}

enum SessionMessage {
    Bridge {
        event_type: String,
        payload: Value,
    },
    PageLoaded {
        url: String,
    },
    MonitorTick,
    RequestInput {
        request: InputRequest,
        reply: oneshot::Sender<Result<String>>,
    },
    Metadata {
        name: Option<String>,
        description: Option<String>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMessage>,
    events: broadcast::Sender<SessionEvent>,
    done: CancellationToken,
}

impl SessionHandle {
    /// Queue one overlay event. Events are handled in the order queued.
    pub async fn on_bridge_event(
        &self,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<()> {
        self.tx
            .send(SessionMessage::Bridge {
                event_type: event_type.into(),
                payload,
            })
            .await
            .map_err(|_| RecorderError::SessionClosed)
    }

    /// Report that a new document finished loading in the session page.
    pub async fn page_loaded(&self, url: impl Into<String>) -> Result<()> {
        self.tx
            .send(SessionMessage::PageLoaded { url: url.into() })
            .await
            .map_err(|_| RecorderError::SessionClosed)
    }

    /// Show `request` in the overlay and wait for the answer.
    ///
    /// Returns an empty string when the session closes first. Fails with
    /// [`RecorderError::InputAlreadyPending`] while another request is open.
    pub async fn request_input(&self, request: InputRequest) -> Result<String> {
        request_via(&self.tx, request).await
    }

    pub async fn set_metadata(
        &self,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        self.tx
            .send(SessionMessage::Metadata { name, description })
            .await
            .map_err(|_| RecorderError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Snapshot { reply })
            .await
            .map_err(|_| RecorderError::SessionClosed)?;
        rx.await.map_err(|_| RecorderError::SessionClosed)
    }

    /// Close the session as the overlay's close button would. Closing an
    /// already closed session is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionMessage::Close { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub async fn wait_closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stream of session events from now on; lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = SessionEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|r| r.ok())
    }

    /// Feed page-bridge signals into the session until it closes.
    pub fn forward_signals(&self, mut signals: broadcast::Receiver<PeerSignal>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = handle.done.cancelled() => break,
                    signal = signals.recv() => signal,
                };
                let forwarded = match signal {
                    Ok(PeerSignal::BridgeEvent {
                        event_type,
                        payload,
                    }) => handle.on_bridge_event(event_type, payload).await,
                    Ok(PeerSignal::PageLoaded { url }) => handle.page_loaded(url).await,
                    Ok(PeerSignal::Connected { url }) => {
                        debug!(url = ?url, "Page peer connected");
                        Ok(())
                    }
                    Ok(PeerSignal::Disconnected) => {
                        warn!("Page peer disconnected; waiting for it to reconnect");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session signal stream lagged, skipped {} signals", skipped);
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if forwarded.is_err() {
                    break;
                }
            }
        })
    }
}

async fn request_via(tx: &mpsc::Sender<SessionMessage>, request: InputRequest) -> Result<String> {
    let (reply, rx) = oneshot::channel();
    if tx
        .send(SessionMessage::RequestInput { request, reply })
        .await
        .is_err()
    {
        return Ok(String::new());
    }
    rx.await.unwrap_or_else(|_| Ok(String::new()))
}

/// Entry points for starting a recording.
pub struct RecordingSession;

impl RecordingSession {
    /// Open a page from `provider`, attach the configured overlay and arm the
    /// session at `url`.
    #[instrument(skip(provider, config))]
    pub async fn start(
        provider: &dyn PageProvider,
        url: &str,
        config: RecorderConfig,
    ) -> Result<SessionHandle> {
        let page = provider.open_page().await?;
        let overlay = Arc::new(PageOverlay::new(
            page.clone(),
            config.overlay_script.clone(),
        ));
        Self::start_with(page, overlay, url, config).await
    }

    /// Arm a session on an already opened page with a custom overlay.
    pub async fn start_with(
        page: Arc<dyn Page>,
        overlay: Arc<dyn Overlay>,
        url: &str,
        config: RecorderConfig,
    ) -> Result<SessionHandle> {
        let buffer = config.event_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let (events, _) = broadcast::channel(buffer);
        let done = CancellationToken::new();
        let monitor_interval = config.monitor_interval;
        let prompt_metadata = config.prompt_metadata;
        let default_name = config.workflow_name.clone();

        let mut actor = SessionActor {
            store: RecordingStore::new(config.output_dir.clone()),
            workflow_name: config.workflow_name.clone(),
            description: config.description.clone(),
            page,
            overlay,
            config,
            normalizer: Normalizer::new(),
            phase: SessionPhase::Idle,
            steps: StepList::new(),
            overlay_log: Vec::new(),
            pending_input: None,
            saved: false,
            current_url: String::new(),
            last_saved: None,
            events: events.clone(),
            done: done.clone(),
            inbox: tx.downgrade(),
        };

        if let Err(e) = actor.open(url).await {
            error!("Error navigating to {}: {}", url, e);
            actor.release_page().await;
            done.cancel();
            return Err(e);
        }

        tokio::spawn(actor.run(rx));
        spawn_monitor(tx.downgrade(), done.clone(), monitor_interval);
        if prompt_metadata {
            spawn_metadata_prompt(tx.clone(), default_name);
        }

        Ok(SessionHandle { tx, events, done })
    }
}

fn spawn_monitor(inbox: mpsc::WeakSender<SessionMessage>, done: CancellationToken, every: Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(tx) = inbox.upgrade() else { break };
                    if tx.send(SessionMessage::MonitorTick).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_metadata_prompt(tx: mpsc::Sender<SessionMessage>, default_name: String) {
    tokio::spawn(async move {
        let non_empty = |answer: Result<String>| match answer {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                debug!("Metadata prompt skipped: {}", e);
                None
            }
        };
        let name = non_empty(
            request_via(
                &tx,
                InputRequest::text("Enter the name for this workflow:")
                    .with_placeholder(default_name),
            )
            .await,
        );
        let description = non_empty(
            request_via(
                &tx,
                InputRequest::text("Enter a description for this workflow:"),
            )
            .await,
        );
        if name.is_some() || description.is_some() {
            let _ = tx
                .send(SessionMessage::Metadata { name, description })
                .await;
        }
    });
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn add_step_command(step: &Step) -> OverlayCommand {
    OverlayCommand::AddWorkflowStep {
        action_label: step.kind.label().to_string(),
        selector: step.selector().map(str::to_string),
    }
}

fn describe_step(step: &Step) -> String {
    match &step.kind {
        StepKind::Navigation => format!("🌐 Recorded navigation to {}", step.url),
        StepKind::Click { selector, .. } => format!("🖱️ Recorded click on {selector}"),
        StepKind::Input { selector, .. } => format!("⌨️ Recorded input into {selector}"),
        StepKind::SelectChange {
            selector,
            selected_text,
            ..
        } => format!("🔽 Recorded selection '{selected_text}' in {selector}"),
        StepKind::KeyPress { selector, key } => {
            format!("⌨️ Recorded key '{key}' on {selector}")
        }
        StepKind::Scroll { scroll_x, scroll_y } => {
            format!("🖱️ Recorded scroll (x={scroll_x}, y={scroll_y})")
        }
    }
}

struct PendingInput {
    request: InputRequest,
    reply: oneshot::Sender<Result<String>>,
}

struct SessionActor {
    page: Arc<dyn Page>,
    overlay: Arc<dyn Overlay>,
    config: RecorderConfig,
    store: RecordingStore,
    normalizer: Normalizer,
    phase: SessionPhase,
    steps: StepList,
    overlay_log: Vec<String>,
    pending_input: Option<PendingInput>,
    saved: bool,
    current_url: String,
    last_saved: Option<PathBuf>,
    workflow_name: String,
    description: String,
    events: broadcast::Sender<SessionEvent>,
    done: CancellationToken,
    inbox: mpsc::WeakSender<SessionMessage>,
}

impl SessionActor {
    async fn open(&mut self, url: &str) -> Result<()> {
        let current = self.page.url().await.unwrap_or_default();
        if current != url {
            info!("🌐 Navigating to {}...", url);
            self.page.goto(url).await?;
        }
        self.current_url = url.to_string();
        self.recover_overlay(true).await;
        self.set_phase(SessionPhase::Armed);
        self.send_overlay(OverlayCommand::SetRecording(false)).await;
        self.output("Page loaded! Press Start to begin recording.")
            .await;
        Ok(())
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionMessage>) {
        while let Some(message) = inbox.recv().await {
            self.handle(message).await;
            if self.phase == SessionPhase::Closed {
                break;
            }
        }
        if self.phase != SessionPhase::Closed {
            info!("All session handles dropped, closing recording session");
            self.close().await;
        }

        inbox.close();
        while let Ok(message) = inbox.try_recv() {
            match message {
                SessionMessage::RequestInput { reply, .. } => {
                    let _ = reply.send(Ok(String::new()));
                }
                SessionMessage::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                SessionMessage::Close { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
    }

    async fn handle(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Bridge {
                event_type,
                payload,
            } => self.on_bridge_event(&event_type, payload).await,
            SessionMessage::PageLoaded { url } => self.on_page_loaded(url).await,
            SessionMessage::MonitorTick => self.recover_overlay(false).await,
            SessionMessage::RequestInput { request, reply } => {
                if self.pending_input.is_some() {
                    let _ = reply.send(Err(RecorderError::InputAlreadyPending));
                    return;
                }
                info!("[🔧 overlay input] Asking for: {}", request.question);
                self.pending_input = Some(PendingInput {
                    request: request.clone(),
                    reply,
                });
                self.send_overlay(OverlayCommand::RequestInput(request))
                    .await;
            }
            SessionMessage::Metadata { name, description } => {
                if let Some(name) = name {
                    self.output(format!("📝 Workflow name set to '{name}'"))
                        .await;
                    self.workflow_name = name;
                }
                if let Some(description) = description {
                    self.description = description;
                }
            }
            SessionMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionMessage::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_bridge_event(&mut self, event_type: &str, payload: Value) {
        let event = match BridgeEvent::parse(event_type, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(%event_type, "Rejected bridge event: {}", e);
                self.output(format!("⚠️ {e}")).await;
                return;
            }
        };
        if self.phase != SessionPhase::Recording && !event.allowed_while_idle() {
            self.output(format!(
                "⚠️ Received '{event_type}' while not recording, ignoring."
            ))
            .await;
            return;
        }
        if let Err(e) = self.apply(event).await {
            error!(%event_type, "Failed to handle bridge event: {}", e);
            self.output(format!("⚠️ {e}")).await;
        }
    }

    async fn apply(&mut self, event: BridgeEvent) -> Result<()> {
        match event {
            BridgeEvent::Control(action) => self.on_control(action).await,
            BridgeEvent::SubmitOverlayInput(value) => {
                match self.pending_input.take() {
                    Some(pending) => {
                        let _ = pending.reply.send(Ok(value));
                    }
                    None => debug!("No input request pending, ignoring submission"),
                }
                Ok(())
            }
            BridgeEvent::Capture(event) => {
                self.record(event).await;
                if let Err(e) = self.overlay.ensure_registered().await {
                    warn!("[⚠️] Could not re-register overlay bridge: {}", e);
                }
                Ok(())
            }
            BridgeEvent::DeleteStep { index } => {
                let removed = self.steps.delete(index)?;
                self.steps_changed().await;
                self.output(format!(
                    "🗑️ Deleted step {}: {}",
                    removed.step_number,
                    removed.kind.label()
                ))
                .await;
                Ok(())
            }
            BridgeEvent::ReorderSteps {
                original_index,
                new_index,
                expected,
            } => {
                self.steps.reorder(original_index, new_index, &expected)?;
                self.steps_changed().await;
                self.output(format!(
                    "↕️ Moved step {} to position {}",
                    original_index + 1,
                    new_index + 1
                ))
                .await;
                Ok(())
            }
            BridgeEvent::Ping => {
                debug!("Ping from overlay");
                Ok(())
            }
        }
    }

    async fn on_control(&mut self, action: ControlAction) -> Result<()> {
        match action {
            ControlAction::Start => {
                if self.phase == SessionPhase::Recording {
                    self.output("Already recording.").await;
                    return Ok(());
                }
                let url = match self.page.url().await {
                    Ok(url) if !url.is_empty() => url,
                    Ok(_) => self.current_url.clone(),
                    Err(e) => {
                        warn!("Could not read page URL, using last known: {}", e);
                        self.current_url.clone()
                    }
                };
                self.current_url = url.clone();
                self.saved = false;
                self.steps.clear();
                self.set_phase(SessionPhase::Recording);
                self.send_overlay(OverlayCommand::SetRecording(true)).await;
                self.send_overlay(OverlayCommand::ClearWorkflowSteps).await;
                self.record(CaptureEvent {
                    event_type: "navigation".into(),
                    timestamp: now_ms(),
                    url,
                    ..Default::default()
                })
                .await;
                self.output("🟢 Recording started.").await;
                Ok(())
            }
            ControlAction::Finish => {
                if self.phase != SessionPhase::Recording {
                    self.output("Not recording.").await;
                    return Ok(());
                }
                self.set_phase(SessionPhase::Armed);
                self.send_overlay(OverlayCommand::SetRecording(false)).await;
                self.output("⛔️ Recording stopped. Saving workflow...").await;
                let saved = self.save().await;
                self.steps.clear();
                self.send_overlay(OverlayCommand::ClearWorkflowSteps).await;
                let _ = self.events.send(SessionEvent::StepsChanged { total: 0 });
                if self.config.prompt_metadata {
                    if let Some(tx) = self.inbox.upgrade() {
                        spawn_metadata_prompt(tx, self.workflow_name.clone());
                    }
                }
                saved.map(|_| ())
            }
            ControlAction::Back => {
                match self.steps.pop() {
                    Some(removed) => {
                        self.steps_changed().await;
                        self.output(format!(
                            "↩️ Removed step {}: {}",
                            removed.step_number,
                            removed.kind.label()
                        ))
                        .await;
                    }
                    None => self.output("No steps to remove.").await,
                }
                Ok(())
            }
            ControlAction::Update => {
                self.output("Updating state").await;
                self.recover_overlay(true).await;
                self.send_overlay(OverlayCommand::RefreshListeners).await;
                self.output("State updated").await;
                Ok(())
            }
            ControlAction::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    async fn on_page_loaded(&mut self, url: String) {
        debug!(%url, "Page loaded, checking overlay");
        self.current_url = url.clone();
        self.recover_overlay(true).await;
        if self.phase == SessionPhase::Recording {
            self.record(CaptureEvent {
                event_type: "navigation".into(),
                timestamp: now_ms(),
                url,
                ..Default::default()
            })
            .await;
        }
    }

    /// Run a capture event through the normalizer and mirror the result.
    async fn record(&mut self, mut event: CaptureEvent) {
        if event.timestamp == 0 {
            event.timestamp = now_ms();
        }
        if event.url.is_empty() {
            event.url = self.current_url.clone();
        } else if event.kind() == Some(CaptureKind::Navigation) {
            self.current_url = event.url.clone();
        }

        match self.normalizer.ingest(&event, &mut self.steps) {
            Ingested::Appended(index) => {
                self.saved = false;
                let Some(step) = self.steps.as_slice().get(index).cloned() else {
                    return;
                };
                self.send_overlay(add_step_command(&step)).await;
                self.output(describe_step(&step)).await;
                let _ = self.events.send(SessionEvent::StepRecorded { step });
            }
            Ingested::Merged(index) => {
                self.saved = false;
                if let Some(step) = self.steps.as_slice().get(index).cloned() {
                    debug!(step = step.step_number, "Input step updated");
                    let _ = self.events.send(SessionEvent::StepRecorded { step });
                }
            }
            Ingested::Dropped => {
                debug!(event_type = %event.event_type, "Capture event produced no step");
            }
        }
    }

    async fn steps_changed(&mut self) {
        self.saved = false;
        self.normalizer.flush();
        self.send_overlay(OverlayCommand::ClearWorkflowSteps).await;
        let commands: Vec<_> = self.steps.iter().map(add_step_command).collect();
        for command in commands {
            self.send_overlay(command).await;
        }
        let _ = self.events.send(SessionEvent::StepsChanged {
            total: self.steps.len(),
        });
    }

    /// Persist the current steps once. Returns the written path, or `None`
    /// when already saved or when there is nothing worth saving.
    async fn save(&mut self) -> Result<Option<PathBuf>> {
        if self.saved {
            debug!("Recording already saved, skipping");
            return Ok(None);
        }
        if self.steps.is_trivial() {
            self.saved = true;
            self.output("No steps were recorded, nothing to save.").await;
            let _ = self.events.send(SessionEvent::NothingToSave);
            return Ok(None);
        }

        let file = crate::events::RecordingFile::new(
            self.workflow_name.clone(),
            self.description.clone(),
            self.steps.to_vec(),
        );
        let path = self
            .store
            .write_with_fallback(&file, &self.config.fallback_path)
            .await?;
        self.saved = true;
        self.last_saved = Some(path.clone());
        self.output(format!("💾 Workflow saved to {}", path.display()))
            .await;
        let _ = self.events.send(SessionEvent::Saved { path: path.clone() });
        Ok(Some(path))
    }

    async fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        let was_recording = self.phase == SessionPhase::Recording;
        if let Some(pending) = self.pending_input.take() {
            let _ = pending.reply.send(Ok(String::new()));
        }
        if was_recording {
            self.send_overlay(OverlayCommand::SetRecording(false)).await;
        }
        if !self.saved && !self.steps.is_trivial() {
            self.output("⛔️ Recording stopped. Saving workflow...").await;
        }
        if let Err(e) = self.save().await {
            error!("Final save failed: {}", e);
            self.output(format!("❌ {e}")).await;
        }
        self.output("📁 Closing recorder session...").await;
        self.set_phase(SessionPhase::Closed);
        self.release_page().await;
        let _ = self.events.send(SessionEvent::Closed);
        self.done.cancel();
    }

    async fn release_page(&self) {
        if let Err(e) = self.page.close().await {
            warn!("Warning: error releasing page: {}", e);
        }
    }

    /// Bring the overlay back after a reload or removal, retrying a bounded
    /// number of times. With `rerender` unset, a present overlay is only
    /// re-registered.
    async fn recover_overlay(&mut self, rerender: bool) {
        let attempts = self.config.overlay_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_recover(rerender).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, attempts, "[⚠️] Overlay recovery failed: {}", e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.overlay_retry_delay).await;
                    }
                }
            }
        }
        error!(
            "Overlay unavailable after {} attempts; continuing without it",
            attempts
        );
    }

    async fn try_recover(&self, rerender: bool) -> Result<()> {
        let recording = self.phase == SessionPhase::Recording;
        let present = self.overlay.is_present().await?;
        if !present {
            info!("[🔁] Reinjecting overlay...");
            self.overlay.inject(recording).await?;
        }
        self.overlay.ensure_registered().await?;
        if present && !rerender {
            return Ok(());
        }

        self.overlay
            .send(&OverlayCommand::SetRecording(recording))
            .await?;
        if !present {
            for message in &self.overlay_log {
                self.overlay
                    .send(&OverlayCommand::RequestOutput(message.clone()))
                    .await?;
            }
            if let Some(pending) = &self.pending_input {
                self.overlay
                    .send(&OverlayCommand::RequestInput(pending.request.clone()))
                    .await?;
            }
        }
        self.overlay
            .send(&OverlayCommand::ClearWorkflowSteps)
            .await?;
        for step in self.steps.iter() {
            self.overlay.send(&add_step_command(step)).await?;
        }
        Ok(())
    }

    /// Log a status message and show it in the overlay.
    async fn output(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        if self.overlay_log.len() >= OVERLAY_LOG_LIMIT {
            let excess = self.overlay_log.len() + 1 - OVERLAY_LOG_LIMIT;
            self.overlay_log.drain(..excess);
        }
        self.overlay_log.push(message.clone());
        if let Err(e) = self
            .overlay
            .send(&OverlayCommand::RequestOutput(message.clone()))
            .await
        {
            debug!("Overlay output not delivered: {}", e);
        }
        let _ = self.events.send(SessionEvent::Output { message });
    }

    async fn send_overlay(&self, command: OverlayCommand) {
        if let Err(e) = self.overlay.send(&command).await {
            warn!(method = command.method(), "Overlay command failed: {}", e);
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Session phase change");
            self.phase = phase;
            let _ = self.events.send(SessionEvent::PhaseChanged { phase });
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            steps: self.steps.to_vec(),
            saved: self.saved,
            pending_input: self.pending_input.as_ref().map(|p| p.request.clone()),
            overlay_log: self.overlay_log.clone(),
            workflow_name: self.workflow_name.clone(),
            description: self.description.clone(),
            last_saved: self.last_saved.clone(),
        }
    }
}
