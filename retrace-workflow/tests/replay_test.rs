use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use retrace::{ActionConfig, AutomationError, Page, PageProvider};
use retrace_recorder::{RecordingFile, Step, StepKind};
use retrace_workflow::{
    ActorOutcome, AutonomousActor, BuildRequest, DeterministicBuilder, ReplayConfig, ReplayEngine,
    StepStatus, WorkflowBuilder, WorkflowDocument, WorkflowError,
};
use serde_json::{json, Map, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Page with a fixed set of elements; every call is logged.
struct FakePage {
    elements: HashSet<String>,
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl FakePage {
    fn with(selectors: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            elements: selectors.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn touch(&self, call: String, selector: &str) -> Result<(), AutomationError> {
        if !self.elements.contains(selector) {
            return Err(AutomationError::SelectorNotFound(selector.to_string()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    async fn url(&self) -> Result<String, AutomationError> {
        Ok("https://shop.example.com/".into())
    }

    async fn goto(&self, url: &str) -> Result<(), AutomationError> {
        self.calls.lock().unwrap().push(format!("goto {url}"));
        Ok(())
    }

    async fn element_tag(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        Ok(self.elements.contains(selector).then(|| "input".to_string()))
    }

    async fn click(&self, selector: &str, _force: bool) -> Result<(), AutomationError> {
        self.touch(format!("click {selector}"), selector)
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), AutomationError> {
        self.touch(format!("fill {selector} {text}"), selector)
    }

    async fn select_option_by_text(
        &self,
        selector: &str,
        text: &str,
    ) -> Result<(), AutomationError> {
        self.touch(format!("select {selector} {text}"), selector)
    }

    async fn press(&self, selector: &str, key: &str) -> Result<(), AutomationError> {
        self.touch(format!("press {selector} {key}"), selector)
    }

    async fn scroll_by(&self, delta_x: i64, delta_y: i64) -> Result<(), AutomationError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("scroll {delta_x} {delta_y}"));
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, AutomationError> {
        Ok(Value::Null)
    }

    async fn close(&self) -> Result<(), AutomationError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeProvider {
    page: Arc<FakePage>,
    opens: AtomicUsize,
}

impl FakeProvider {
    fn new(page: Arc<FakePage>) -> Arc<Self> {
        Arc::new(Self {
            page,
            opens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PageProvider for FakeProvider {
    async fn open_page(&self) -> Result<Arc<dyn Page>, AutomationError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.page.clone())
    }
}

/// Actor with a fixed answer that remembers the tasks it was given.
struct StubActor {
    succeed: bool,
    delay: Duration,
    tasks: Mutex<Vec<(String, u32)>>,
}

impl StubActor {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            succeed,
            delay: Duration::ZERO,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            delay,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn tasks(&self) -> Vec<(String, u32)> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutonomousActor for StubActor {
    async fn attempt(
        &self,
        task: &str,
        _page: &dyn Page,
        max_steps: u32,
    ) -> Result<ActorOutcome, AutomationError> {
        self.tasks
            .lock()
            .unwrap()
            .push((task.to_string(), max_steps));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(if self.succeed {
            ActorOutcome::succeeded("done by actor", 2)
        } else {
            ActorOutcome::failed("could not find it", max_steps)
        })
    }
}

fn fast_config(fallback_to_actor: bool) -> ReplayConfig {
    ReplayConfig {
        fallback_to_actor,
        action: ActionConfig {
            timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(10),
        },
        ..ReplayConfig::default()
    }
}

/// navigate, fill the search box, click a button that does not exist, scroll.
fn checkout_document() -> WorkflowDocument {
    WorkflowDocument::from_json(json!({
        "name": "checkout",
        "description": "search and buy",
        "inputSchema": {
            "type": "object",
            "properties": {"term": {"type": "string"}},
            "required": ["term"]
        },
        "steps": [
            {"kind": "deterministic", "action": "navigate", "params": {"url": "https://shop.example.com/"}, "description": "Open URL https://shop.example.com/"},
            {"kind": "deterministic", "action": "input", "params": {"selector": "#search", "text": "{{term}}"}, "description": "Input text into #search"},
            {"kind": "deterministic", "action": "click", "params": {"selector": "#buy-now"}, "description": "Click element #buy-now"},
            {"kind": "deterministic", "action": "scroll", "params": {"deltaX": 0, "deltaY": 300}}
        ]
    }))
    .unwrap()
}

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_missing_selector_without_fallback_names_step() {
    init_tracing();
    let page = FakePage::with(&["#search"]);
    let provider = FakeProvider::new(page.clone());
    let actor = StubActor::new(true);
    let engine = ReplayEngine::new(provider.clone(), fast_config(false)).with_actor(actor.clone());

    let report = engine
        .run_with_inputs(&checkout_document(), inputs(json!({"term": "socks"})))
        .await
        .unwrap();

    println!("📋 {}", report.summary());
    assert!(!report.success);
    assert_eq!(report.failed_step, Some(3));
    assert!(report.error.as_deref().unwrap().contains("#buy-now"));
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.steps[2].status, StepStatus::Failed);
    assert_eq!(
        report.steps[2].error_kind.as_deref(),
        Some("selector_not_found")
    );
    // The scroll after the failure never ran and the actor was never asked.
    assert_eq!(
        page.calls(),
        vec!["goto https://shop.example.com/", "fill #search socks"]
    );
    assert!(actor.tasks().is_empty());
    assert_eq!(page.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fallback_actor_completes_run() {
    init_tracing();
    let page = FakePage::with(&["#search"]);
    let provider = FakeProvider::new(page.clone());
    let actor = StubActor::new(true);
    let engine = ReplayEngine::new(provider, fast_config(true)).with_actor(actor.clone());

    let report = engine
        .run_with_inputs(&checkout_document(), inputs(json!({"term": "socks"})))
        .await
        .unwrap();

    println!("📋 {}", report.summary());
    assert!(report.success);
    assert_eq!(report.failed_step, None);
    assert_eq!(report.steps.len(), 4);
    assert_eq!(report.steps[2].status, StepStatus::RecoveredByActor);
    assert_eq!(report.steps[2].error_kind, None);
    assert_eq!(report.recovered_steps(), 1);

    let tasks = actor.tasks();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].0.starts_with("Click element #buy-now"));
    assert_eq!(tasks[0].1, 5);
    assert_eq!(page.calls().last().unwrap(), "scroll 0 300");
}

#[tokio::test]
async fn test_actor_giving_up_fails_step() {
    init_tracing();
    let page = FakePage::with(&["#search"]);
    let engine = ReplayEngine::new(FakeProvider::new(page), fast_config(true))
        .with_actor(StubActor::new(false));

    let report = engine
        .run_with_inputs(&checkout_document(), inputs(json!({"term": "socks"})))
        .await
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.failed_step, Some(3));
    let failed = report.first_failure().unwrap();
    assert!(failed.error.as_deref().unwrap().contains("could not find it"));
    assert_eq!(failed.actor.as_ref().map(|a| a.success), Some(false));
}

#[tokio::test]
async fn test_unresolved_placeholder_fails_before_start() {
    init_tracing();
    let page = FakePage::with(&["#search"]);
    let provider = FakeProvider::new(page.clone());
    let engine = ReplayEngine::new(provider.clone(), fast_config(true));

    let mut document = checkout_document();
    document.input_schema.required.clear();
    let err = engine
        .run_with_inputs(&document, Map::new())
        .await
        .unwrap_err();

    match err {
        WorkflowError::UnresolvedPlaceholders(names) => assert_eq!(names, vec!["term"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.opens.load(Ordering::SeqCst), 0);
    assert!(page.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_inputs_rejected() {
    init_tracing();
    let provider = FakeProvider::new(FakePage::with(&[]));
    let engine = ReplayEngine::new(provider.clone(), fast_config(true));

    let err = engine
        .run_with_inputs(&checkout_document(), Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidInputs(_)));

    let err = engine
        .run_with_inputs(&checkout_document(), inputs(json!({"term": 12})))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidInputs(_)));
    assert_eq!(provider.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_action_and_bad_params_rejected() {
    init_tracing();
    let provider = FakeProvider::new(FakePage::with(&[]));
    let engine = ReplayEngine::new(provider.clone(), fast_config(true));

    let unknown = WorkflowDocument::from_json(json!({
        "name": "hover",
        "steps": [{"kind": "deterministic", "action": "hover", "params": {"selector": "#a"}}]
    }))
    .unwrap();
    assert!(matches!(
        engine.run_with_inputs(&unknown, Map::new()).await,
        Err(WorkflowError::UnknownAction { step: 1, .. })
    ));

    let bad = WorkflowDocument::from_json(json!({
        "name": "bad",
        "steps": [{"kind": "deterministic", "action": "click", "params": {"selector": "#a", "button": "left"}}]
    }))
    .unwrap();
    assert!(matches!(
        engine.run_with_inputs(&bad, Map::new()).await,
        Err(WorkflowError::InvalidParams { step: 1, .. })
    ));
    assert_eq!(provider.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_agent_steps_go_to_actor() {
    init_tracing();
    let page = FakePage::with(&[]);
    let actor = StubActor::new(true);
    let engine =
        ReplayEngine::new(FakeProvider::new(page), fast_config(false)).with_actor(actor.clone());

    let document = WorkflowDocument::from_json(json!({
        "name": "agentic",
        "inputSchema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]},
        "steps": [
            {"kind": "agent", "task": "pick the cheapest hotel in {{city}}", "maxSteps": 8},
            {"kind": "agent", "task": "confirm the booking"}
        ]
    }))
    .unwrap();

    let report = engine
        .run_with_inputs(&document, inputs(json!({"city": "Lisbon"})))
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Agent));
    assert_eq!(
        actor.tasks(),
        vec![
            ("pick the cheapest hotel in Lisbon".to_string(), 8),
            ("confirm the booking".to_string(), 5),
        ]
    );
}

#[tokio::test]
async fn test_agent_step_without_actor_fails() {
    init_tracing();
    let engine = ReplayEngine::new(FakeProvider::new(FakePage::with(&[])), fast_config(true));
    let document = WorkflowDocument::from_json(json!({
        "name": "agentic",
        "steps": [{"kind": "agent", "task": "do something clever"}]
    }))
    .unwrap();

    let report = engine.run_with_inputs(&document, Map::new()).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.failed_step, Some(1));
}

#[tokio::test]
async fn test_cancellation_stops_current_and_later_steps() {
    init_tracing();
    let page = FakePage::with(&[]);
    let provider = FakeProvider::new(page.clone());
    let actor = StubActor::slow(Duration::from_secs(30));
    let engine = Arc::new(ReplayEngine::new(provider, fast_config(true)).with_actor(actor.clone()));

    let document = WorkflowDocument::from_json(json!({
        "name": "long",
        "steps": [
            {"kind": "agent", "task": "browse for a long time"},
            {"kind": "deterministic", "action": "scroll", "params": {"deltaX": 0, "deltaY": 10}}
        ]
    }))
    .unwrap();

    let token = engine.cancellation_token();
    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_with_inputs(&document, Map::new()).await })
    };
    while actor.tasks().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should stop promptly")
        .unwrap()
        .unwrap();

    assert!(report.cancelled);
    assert!(!report.success);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Cancelled);
    assert_eq!(report.steps[0].error_kind.as_deref(), Some("cancelled"));
    assert!(page.calls().is_empty());
    assert_eq!(page.closes.load(Ordering::SeqCst), 1);

    // A cancelled engine refuses new runs.
    let again = engine
        .run_with_inputs(
            &WorkflowDocument::from_json(json!({"name": "x", "steps": []})).unwrap(),
            Map::new(),
        )
        .await;
    assert!(matches!(again, Err(WorkflowError::Cancelled)));
}

#[tokio::test]
async fn test_run_as_tool_resolves_prompt() {
    init_tracing();
    let page = FakePage::with(&["#search", "#buy-now"]);
    let engine = ReplayEngine::new(FakeProvider::new(page.clone()), fast_config(false));

    let report = engine
        .run_as_tool(&checkout_document(), "term=gloves")
        .await
        .unwrap();

    assert!(report.success, "{}", report.summary());
    assert!(page.calls().contains(&"fill #search gloves".to_string()));
    assert!(page.calls().contains(&"click #buy-now".to_string()));
}

#[tokio::test]
async fn test_typed_inputs_fill_text_params() {
    init_tracing();
    let page = FakePage::with(&["#qty", "#size", "#gift"]);
    let engine = ReplayEngine::new(FakeProvider::new(page.clone()), fast_config(false));

    let document = WorkflowDocument::from_json(json!({
        "name": "quantities",
        "inputSchema": {
            "type": "object",
            "properties": {
                "qty": {"type": "number"},
                "size": {"type": "number"},
                "gift": {"type": "boolean"},
                "distance": {"type": "number"}
            },
            "required": ["qty", "size", "gift", "distance"]
        },
        "steps": [
            {"kind": "deterministic", "action": "input", "params": {"selector": "#qty", "text": "{{qty}}"}},
            {"kind": "deterministic", "action": "selectChange", "params": {"selector": "#size", "text": "{{size}}"}},
            {"kind": "deterministic", "action": "input", "params": {"selector": "#gift", "text": "{{gift}}"}},
            {"kind": "deterministic", "action": "scroll", "params": {"deltaX": 0, "deltaY": "{{distance}}"}}
        ]
    }))
    .unwrap();

    let report = engine
        .run_with_inputs(
            &document,
            inputs(json!({"qty": 3, "size": 42, "gift": true, "distance": 250})),
        )
        .await
        .unwrap();

    assert!(report.success, "{}", report.summary());
    assert_eq!(
        page.calls(),
        vec![
            "fill #qty 3",
            "select #size 42",
            "fill #gift true",
            "scroll 0 250"
        ]
    );
}

#[tokio::test]
async fn test_recorded_braces_replay_verbatim() {
    init_tracing();
    let page = FakePage::with(&["#coupon"]);
    let engine = ReplayEngine::new(FakeProvider::new(page.clone()), fast_config(false));

    let recording = RecordingFile::new(
        "coupon",
        "",
        vec![
            Step::navigation(1, "https://shop.example.com/"),
            Step::new(
                2,
                "https://shop.example.com/",
                StepKind::Input {
                    selector: "#coupon".into(),
                    value: "{{SPRING24}}".into(),
                },
            ),
        ],
    );
    let document = DeterministicBuilder::new()
        .build(&recording, &BuildRequest::default())
        .await
        .unwrap();

    let report = engine.run_with_inputs(&document, Map::new()).await.unwrap();
    assert!(report.success, "{}", report.summary());
    assert_eq!(page.calls().last().unwrap(), "fill #coupon {{SPRING24}}");
}
