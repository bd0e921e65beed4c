//! Deterministic browser actions and the registry that dispatches them by name.
//!
//! Each registered action declares its parameter schema and performs exactly
//! one operation against the page. Parameters are validated strictly: unknown
//! fields are rejected so a workflow document cannot silently carry data the
//! executor ignores.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{AutomationError, Page};

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Timing shared by every executor.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Hard bound for one action, including waiting for its element.
    pub timeout: Duration,
    /// Delay between lookups while an element has not appeared yet.
    pub poll_interval: Duration,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ACTION_TIMEOUT,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamField {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: ParamType,
}

/// Name, description and parameter schema of one registered action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamField>,
}

impl ActionSpec {
    pub fn param_kind(&self, name: &str) -> Option<ParamType> {
        self.params.iter().find(|f| f.name == name).map(|f| f.kind)
    }

    /// JSON-schema rendering of the parameters, as shown to workflow builders.
    pub fn params_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .params
            .iter()
            .map(|f| {
                let ty = match f.kind {
                    ParamType::String => "string",
                    ParamType::Integer => "integer",
                };
                (f.name.to_string(), serde_json::json!({ "type": ty }))
            })
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.params.iter().map(|f| f.name).collect::<Vec<_>>(),
            "additionalProperties": false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct NavigateParams {
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectorParams {
    selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectorTextParams {
    selector: String,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyPressParams {
    selector: String,
    key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ScrollParams {
    #[serde(alias = "scrollX")]
    delta_x: i64,
    #[serde(alias = "scrollY")]
    delta_y: i64,
}

/// One validated action invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BrowserAction {
    Navigate { url: String },
    Click { selector: String },
    Input { selector: String, text: String },
    SelectChange { selector: String, text: String },
    KeyPress { selector: String, key: String },
    Scroll { delta_x: i64, delta_y: i64 },
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserAction::Navigate { .. } => "navigate",
            BrowserAction::Click { .. } => "click",
            BrowserAction::Input { .. } => "input",
            BrowserAction::SelectChange { .. } => "selectChange",
            BrowserAction::KeyPress { .. } => "keyPress",
            BrowserAction::Scroll { .. } => "scroll",
        }
    }

    fn selector(&self) -> Option<&str> {
        match self {
            BrowserAction::Click { selector }
            | BrowserAction::Input { selector, .. }
            | BrowserAction::SelectChange { selector, .. }
            | BrowserAction::KeyPress { selector, .. } => Some(selector),
            BrowserAction::Navigate { .. } | BrowserAction::Scroll { .. } => None,
        }
    }

    /// A single attempt; a missing element surfaces as `SelectorNotFound`.
    async fn attempt(&self, page: &dyn Page) -> Result<ActionOutcome, AutomationError> {
        match self {
            BrowserAction::Navigate { url } => {
                page.goto(url).await?;
                Ok(ActionOutcome::done(self, format!("🔗  Navigated to {url}")))
            }
            BrowserAction::Click { selector } => {
                page.click(selector, true).await?;
                Ok(ActionOutcome::done(
                    self,
                    format!("🖱️  Clicked element with selector: {selector}"),
                ))
            }
            BrowserAction::Input { selector, text } => {
                match page.element_tag(selector).await? {
                    None => Err(AutomationError::SelectorNotFound(selector.clone())),
                    Some(tag) if tag == "select" => Ok(ActionOutcome::skipped(
                        self,
                        format!("Skipped input into select element {selector}"),
                    )),
                    Some(_) => {
                        page.fill(selector, text).await?;
                        Ok(ActionOutcome::done(
                            self,
                            format!("⌨️  Input \"{text}\" into element with selector: {selector}"),
                        ))
                    }
                }
            }
            BrowserAction::SelectChange { selector, text } => {
                page.select_option_by_text(selector, text).await?;
                Ok(ActionOutcome::done(
                    self,
                    format!("Selected option \"{text}\" in dropdown {selector}"),
                ))
            }
            BrowserAction::KeyPress { selector, key } => {
                page.press(selector, key).await?;
                Ok(ActionOutcome::done(
                    self,
                    format!("Pressed key '{key}' on element {selector}"),
                ))
            }
            BrowserAction::Scroll { delta_x, delta_y } => {
                page.scroll_by(*delta_x, *delta_y).await?;
                Ok(ActionOutcome::done(
                    self,
                    format!("Scrolled page by (x={delta_x}, y={delta_y})"),
                ))
            }
        }
    }
}

impl fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector() {
            Some(selector) => write!(f, "{}({})", self.name(), selector),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// What an executor did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub action: String,
    pub message: String,
    /// True when the executor deliberately did nothing (input into a select).
    pub skipped: bool,
}

impl ActionOutcome {
    fn done(action: &BrowserAction, message: String) -> Self {
        Self {
            action: action.name().to_string(),
            message,
            skipped: false,
        }
    }

    fn skipped(action: &BrowserAction, message: String) -> Self {
        Self {
            action: action.name().to_string(),
            message,
            skipped: true,
        }
    }
}

type ParseFn = fn(Value) -> Result<BrowserAction, serde_json::Error>;

struct RegisteredAction {
    spec: ActionSpec,
    parse: ParseFn,
}

fn parse_as<P: DeserializeOwned>(value: Value) -> Result<P, serde_json::Error> {
    serde_json::from_value(value)
}

/// Name-indexed table of deterministic actions.
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, RegisteredAction>,
    aliases: BTreeMap<&'static str, &'static str>,
    config: ActionConfig,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new(ActionConfig::default())
    }
}

impl ActionRegistry {
    pub fn new(config: ActionConfig) -> Self {
        use ParamType::{Integer, String as Str};

        let mut registry = Self {
            actions: BTreeMap::new(),
            aliases: BTreeMap::new(),
            config,
        };
        registry.register(
            "navigate",
            "Navigate the page to a URL",
            &[("url", Str)],
            |v| parse_as::<NavigateParams>(v).map(|p| BrowserAction::Navigate { url: p.url }),
        );
        registry.register(
            "click",
            "Click element by CSS selector or XPath",
            &[("selector", Str)],
            |v| {
                parse_as::<SelectorParams>(v).map(|p| BrowserAction::Click {
                    selector: p.selector,
                })
            },
        );
        registry.register(
            "input",
            "Input text into an element by CSS selector or XPath",
            &[("selector", Str), ("text", Str)],
            |v| {
                parse_as::<SelectorTextParams>(v).map(|p| BrowserAction::Input {
                    selector: p.selector,
                    text: p.text,
                })
            },
        );
        registry.register(
            "selectChange",
            "Select dropdown option by selector and visible text",
            &[("selector", Str), ("text", Str)],
            |v| {
                parse_as::<SelectorTextParams>(v).map(|p| BrowserAction::SelectChange {
                    selector: p.selector,
                    text: p.text,
                })
            },
        );
        registry.register(
            "keyPress",
            "Press a key on an element",
            &[("selector", Str), ("key", Str)],
            |v| {
                parse_as::<KeyPressParams>(v).map(|p| BrowserAction::KeyPress {
                    selector: p.selector,
                    key: p.key,
                })
            },
        );
        registry.register(
            "scroll",
            "Scroll the page by a pixel offset",
            &[("deltaX", Integer), ("deltaY", Integer)],
            |v| {
                parse_as::<ScrollParams>(v).map(|p| BrowserAction::Scroll {
                    delta_x: p.delta_x,
                    delta_y: p.delta_y,
                })
            },
        );

        // Names produced by earlier recorders.
        registry.aliases.insert("click_element", "click");
        registry.aliases.insert("select_change", "selectChange");
        registry.aliases.insert("key_press", "keyPress");
        registry
    }

    fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        params: &[(&'static str, ParamType)],
        parse: ParseFn,
    ) {
        let spec = ActionSpec {
            name,
            description,
            params: params
                .iter()
                .map(|(name, kind)| ParamField { name, kind: *kind })
                .collect(),
        };
        self.actions.insert(name, RegisteredAction { spec, parse });
    }

    pub fn config(&self) -> &ActionConfig {
        &self.config
    }

    fn lookup(&self, name: &str) -> Option<&RegisteredAction> {
        let canonical = self.aliases.get(name).copied().unwrap_or(name);
        self.actions.get(canonical)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn spec(&self, name: &str) -> Option<&ActionSpec> {
        self.lookup(name).map(|a| &a.spec)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values().map(|a| &a.spec)
    }

    /// Check `params` against the schema of `name` without touching a page.
    pub fn validate(&self, name: &str, params: &Value) -> Result<BrowserAction, AutomationError> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| AutomationError::UnknownAction(name.to_string()))?;
        (entry.parse)(params.clone()).map_err(|e| {
            AutomationError::InvalidArgument(format!("invalid params for '{name}': {e}"))
        })
    }

    /// Validate and run one action within the configured timeout.
    #[instrument(skip(self, page, params))]
    pub async fn execute(
        &self,
        page: &dyn Page,
        name: &str,
        params: &Value,
    ) -> Result<ActionOutcome, AutomationError> {
        let action = self.validate(name, params)?;
        self.run(page, &action).await
    }

    /// Run an already validated action. Missing elements are polled for until
    /// the deadline; the last `SelectorNotFound` is returned if they never
    /// appear, and an attempt still pending at the deadline is a `Timeout`.
    pub async fn run(
        &self,
        page: &dyn Page,
        action: &BrowserAction,
    ) -> Result<ActionOutcome, AutomationError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, action.attempt(page)).await {
                Ok(Ok(outcome)) => {
                    info!("{}", outcome.message);
                    return Ok(outcome);
                }
                Ok(Err(AutomationError::SelectorNotFound(selector))) => {
                    if Instant::now() + self.config.poll_interval >= deadline {
                        warn!(%selector, action = %action, "element never appeared");
                        return Err(AutomationError::SelectorNotFound(selector));
                    }
                    debug!(%selector, "element not present yet, polling");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(Err(e)) => {
                    warn!(action = %action, error = %e, "action failed");
                    return Err(e);
                }
                Err(_) => {
                    warn!(action = %action, "action timed out");
                    return Err(AutomationError::Timeout(format!(
                        "{action} exceeded {}ms",
                        self.config.timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Bullet list of actions with their parameter schema.
    pub fn describe_markdown(&self) -> String {
        let mut lines = Vec::new();
        for spec in self.specs() {
            lines.push(format!("- **{}**: {}", spec.name, spec.description));
            lines.push(format!("  - params: {}", spec.params_schema()));
        }
        lines.join("\n")
    }
}
