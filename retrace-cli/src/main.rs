//! Retrace CLI
//!
//! Usage from workspace root:
//!   cargo run --bin retrace -- record https://example.com     # Record through the overlay
//!   cargo run --bin retrace -- normalize session.json         # Raw capture log -> recording
//!   cargo run --bin retrace -- build recording.json -o wf.json
//!   cargo run --bin retrace -- replay wf.json --inputs '{"term":"rust"}'
//!   cargo run --bin retrace -- actions                        # List replayable actions

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use retrace::{
    ActionConfig, ActionRegistry, BridgeConfig, BridgePageProvider, ExtensionBridge,
};
use retrace_recorder::{
    load_capture_log, load_recording, normalize, storage::write_to, OverlayScript, RecorderConfig,
    RecordingFile, RecordingSession, SessionEvent,
};
use retrace_workflow::{
    BuildRequest, DeterministicBuilder, ReplayConfig, ReplayEngine, WorkflowBuilder,
    WorkflowDocument,
};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "retrace")]
#[command(about = "🎬 Retrace - record browser workflows and replay them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct BridgeArgs {
    /// Address the extension bridge listens on
    #[clap(long, env = "RETRACE_BRIDGE_ADDR", default_value = "127.0.0.1:17373")]
    addr: String,

    /// Timeout for one script evaluation in the page, in milliseconds
    #[clap(long, default_value_t = 5000)]
    eval_timeout_ms: u64,

    /// How long to wait for a browser tab to connect, in seconds
    #[clap(long, default_value_t = 30)]
    connect_timeout_secs: u64,
}

impl BridgeArgs {
    async fn provider(&self) -> Result<BridgePageProvider> {
        let config = BridgeConfig {
            addr: self.addr.clone(),
            eval_timeout: Duration::from_millis(self.eval_timeout_ms),
            ..BridgeConfig::default()
        };
        let bridge = Arc::new(ExtensionBridge::start(&config).await);
        if !bridge.is_listening() {
            bail!("extension bridge could not listen on {}", self.addr);
        }
        info!("🔌 Extension bridge listening on {}", self.addr);
        Ok(
            BridgePageProvider::new(bridge, config.eval_timeout)
                .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs)),
        )
    }
}

#[derive(Parser, Debug)]
struct RecordArgs {
    /// Page to open before recording starts
    url: String,

    #[clap(flatten)]
    bridge: BridgeArgs,

    /// Directory receiving finished recordings
    #[clap(long, short = 'o', default_value = "recordings")]
    output_dir: PathBuf,

    /// Written instead when the output directory cannot be written
    #[clap(long, default_value = "workflow_fallback.json")]
    fallback: PathBuf,

    #[clap(long, default_value = "recording")]
    name: String,

    #[clap(long, default_value = "")]
    description: String,

    /// Overlay script to inject instead of the embedded one
    #[clap(long)]
    overlay: Option<PathBuf>,

    /// Ask for the workflow name and description through the overlay
    #[clap(long)]
    prompt_metadata: bool,

    /// Overlay presence check interval in milliseconds, 0 to disable
    #[clap(long, default_value_t = 2000)]
    monitor_interval_ms: u64,
}

#[derive(Parser, Debug)]
struct NormalizeArgs {
    /// Raw capture log: a JSON array of events or {"events": [...]}
    input: PathBuf,

    /// Where to write the recording; printed to stdout when omitted
    #[clap(long, short = 'o')]
    output: Option<PathBuf>,

    #[clap(long, default_value = "recording")]
    name: String,

    #[clap(long, default_value = "")]
    description: String,
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Recording file written by `record` or `normalize`
    recording: PathBuf,

    /// Where to write the workflow document; printed to stdout when omitted
    #[clap(long, short = 'o')]
    output: Option<PathBuf>,

    /// Workflow name, defaults to a generic deterministic name
    #[clap(long)]
    name: Option<String>,

    #[clap(long)]
    description: Option<String>,

    /// What the workflow should accomplish, passed on to the builder
    #[clap(long)]
    goal: Option<String>,

    /// Raw capture log to attach as builder material
    #[clap(long)]
    events: Option<PathBuf>,

    /// Keep valid screenshots from the capture log as attachments
    #[clap(long, requires = "events")]
    screenshots: bool,

    /// Also write the builder request (goal, actions, capture log) as JSON
    #[clap(long)]
    request_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Workflow document to run
    workflow: PathBuf,

    #[clap(flatten)]
    bridge: BridgeArgs,

    /// Workflow inputs as a JSON object
    #[clap(long, conflicts_with = "prompt")]
    inputs: Option<String>,

    /// Free-form inputs, either JSON or name=value pairs
    #[clap(long)]
    prompt: Option<String>,

    /// Abort on the first failed deterministic step instead of asking the actor
    #[clap(long)]
    no_fallback: bool,

    /// Actor step budget for steps without maxSteps
    #[clap(long, default_value_t = retrace_workflow::DEFAULT_MAX_STEPS)]
    max_steps: u32,

    /// Timeout for one action in milliseconds
    #[clap(long, default_value_t = 5000)]
    action_timeout_ms: u64,

    /// Write the run report here as JSON
    #[clap(long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a workflow through the in-page overlay
    Record(RecordArgs),
    /// Convert a raw capture log into a recording
    Normalize(NormalizeArgs),
    /// Build a deterministic workflow document from a recording
    Build(BuildArgs),
    /// Replay a workflow document
    Replay(ReplayArgs),
    /// List the actions a deterministic step can use
    Actions,
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            // Respect RUST_LOG if provided, else default to info
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Record(args) => record(args).await,
        Commands::Normalize(args) => normalize_log(args).await,
        Commands::Build(args) => build(args).await,
        Commands::Replay(args) => replay(args).await,
        Commands::Actions => {
            println!("{}", ActionRegistry::default().describe_markdown());
            Ok(())
        }
    }
}

async fn record(args: RecordArgs) -> Result<()> {
    let overlay_script = match &args.overlay {
        Some(path) => OverlayScript::from_path(path)
            .with_context(|| format!("Failed to load overlay script {}", path.display()))?,
        None => OverlayScript::embedded(),
    };
    let config = RecorderConfig {
        output_dir: args.output_dir.clone(),
        fallback_path: args.fallback.clone(),
        workflow_name: args.name.clone(),
        description: args.description.clone(),
        overlay_script,
        prompt_metadata: args.prompt_metadata,
        monitor_interval: Duration::from_millis(args.monitor_interval_ms),
        ..RecorderConfig::default()
    };

    let provider = args.bridge.provider().await?;
    let signals = provider.bridge().subscribe();
    info!("Waiting for a browser tab to connect...");
    let session = RecordingSession::start(&provider, &args.url, config)
        .await
        .context("Failed to start recording session")?;
    let forwarder = session.forward_signals(signals);

    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Saved { path } => println!("{}", path.display()),
                SessionEvent::Closed => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = session.wait_closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, closing session");
            session.close().await.context("Failed to close session")?;
        }
    }
    forwarder.abort();
    if let Err(e) = printer.await {
        warn!("event printer stopped abnormally: {}", e);
    }
    Ok(())
}

async fn normalize_log(args: NormalizeArgs) -> Result<()> {
    let events = load_capture_log(&args.input)
        .await
        .with_context(|| format!("Failed to load capture log {}", args.input.display()))?;
    let steps = normalize(&events);
    info!(
        "Normalized {} events into {} steps",
        events.len(),
        steps.len()
    );
    let file = RecordingFile::new(args.name, args.description, steps);
    match &args.output {
        Some(path) => write_to(path, &file)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", serde_json::to_string_pretty(&file)?),
    }
    Ok(())
}

async fn build(args: BuildArgs) -> Result<()> {
    let recording = load_recording(&args.recording)
        .await
        .with_context(|| format!("Failed to load recording {}", args.recording.display()))?;
    let mut builder = DeterministicBuilder::new();
    if let Some(name) = args.name {
        builder = builder.with_name(name);
    }
    if let Some(description) = args.description {
        builder = builder.with_description(description);
    }
    let mut request = BuildRequest::new(&ActionRegistry::default());
    if let Some(goal) = args.goal {
        request = request.with_goal(goal);
    }
    if let Some(path) = &args.events {
        let events = load_capture_log(path)
            .await
            .with_context(|| format!("Failed to load capture log {}", path.display()))?;
        request = request.with_events(&events, args.screenshots);
        info!(
            "Attached {} events and {} screenshots",
            request.material.events.len(),
            request.material.attachments.len()
        );
    }
    if let Some(path) = &args.request_out {
        tokio::fs::write(path, serde_json::to_vec_pretty(&request)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    let document = builder.build(&recording, &request).await?;
    write_document(&document, args.output.as_deref()).await
}

async fn write_document(document: &WorkflowDocument, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => document
            .save(path)
            .await
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{}", serde_json::to_string_pretty(document)?);
            Ok(())
        }
    }
}

fn parse_inputs(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--inputs is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--inputs must be a JSON object, got {other}"),
    }
}

async fn replay(args: ReplayArgs) -> Result<()> {
    let document = WorkflowDocument::load(&args.workflow)
        .await
        .with_context(|| format!("Failed to load workflow {}", args.workflow.display()))?;
    let config = ReplayConfig {
        fallback_to_actor: !args.no_fallback,
        default_max_steps: args.max_steps,
        action: ActionConfig {
            timeout: Duration::from_millis(args.action_timeout_ms),
            ..ActionConfig::default()
        },
    };

    let provider = args.bridge.provider().await?;
    let cancellation = CancellationToken::new();
    let engine = ReplayEngine::new(Arc::new(provider), config).with_cancellation(cancellation.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling replay");
            cancellation.cancel();
        }
    });

    let report = match (&args.inputs, &args.prompt) {
        (_, Some(prompt)) => engine.run_as_tool(&document, prompt).await?,
        (Some(raw), None) => engine.run_with_inputs(&document, parse_inputs(raw)?).await?,
        (None, None) => engine.run_with_inputs(&document, Map::new()).await?,
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?,
        None => println!("{json}"),
    }
    if !report.success {
        bail!(report.summary());
    }
    Ok(())
}
