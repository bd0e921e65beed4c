use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use retrace::{ActionConfig, ActionRegistry, AutomationError, Page};
use serde_json::{json, Value};

/// In-memory page: elements are a selector -> tag map, and elements listed in
/// `appear_after` only become visible after that many lookups.
#[derive(Default)]
struct FakePage {
    elements: Mutex<HashMap<String, String>>,
    appear_after: Mutex<HashMap<String, usize>>,
    lookups: AtomicUsize,
    hang_on_click: bool,
    calls: Mutex<Vec<String>>,
}

impl FakePage {
    fn with(elements: &[(&str, &str)]) -> Self {
        let page = FakePage::default();
        {
            let mut map = page.elements.lock().unwrap();
            for (sel, tag) in elements {
                map.insert(sel.to_string(), tag.to_string());
            }
        }
        page
    }

    fn present(&self, selector: &str) -> bool {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(after) = self.appear_after.lock().unwrap().get(selector) {
            if n < *after {
                return false;
            }
        }
        self.elements.lock().unwrap().contains_key(selector)
    }

    fn require(&self, selector: &str) -> Result<(), AutomationError> {
        if self.present(selector) {
            Ok(())
        } else {
            Err(AutomationError::SelectorNotFound(selector.to_string()))
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Page for FakePage {
    async fn url(&self) -> Result<String, AutomationError> {
        Ok("https://example.com/".into())
    }

    async fn goto(&self, url: &str) -> Result<(), AutomationError> {
        self.record(format!("goto {url}"));
        Ok(())
    }

    async fn element_tag(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        if self.present(selector) {
            Ok(self.elements.lock().unwrap().get(selector).cloned())
        } else {
            Ok(None)
        }
    }

    async fn click(&self, selector: &str, force: bool) -> Result<(), AutomationError> {
        if self.hang_on_click {
            futures_pending().await;
        }
        self.require(selector)?;
        self.record(format!("click {selector} force={force}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), AutomationError> {
        self.require(selector)?;
        self.record(format!("fill {selector} {text}"));
        Ok(())
    }

    async fn select_option_by_text(
        &self,
        selector: &str,
        text: &str,
    ) -> Result<(), AutomationError> {
        self.require(selector)?;
        self.record(format!("select {selector} {text}"));
        Ok(())
    }

    async fn press(&self, selector: &str, key: &str) -> Result<(), AutomationError> {
        self.require(selector)?;
        self.record(format!("press {selector} {key}"));
        Ok(())
    }

    async fn scroll_by(&self, delta_x: i64, delta_y: i64) -> Result<(), AutomationError> {
        self.record(format!("scroll {delta_x} {delta_y}"));
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, AutomationError> {
        Ok(Value::Null)
    }

    async fn close(&self) -> Result<(), AutomationError> {
        Ok(())
    }
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

fn fast_registry() -> ActionRegistry {
    ActionRegistry::new(ActionConfig {
        timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
    })
}

#[tokio::test]
async fn test_click_is_forced() {
    let page = FakePage::with(&[("#go", "button")]);
    let registry = fast_registry();
    let outcome = registry
        .execute(&page, "click", &json!({"selector": "#go"}))
        .await
        .unwrap();
    assert!(!outcome.skipped);
    assert_eq!(page.calls(), vec!["click #go force=true"]);
}

#[tokio::test]
async fn test_click_waits_for_late_element() {
    let page = FakePage::with(&[("#late", "button")]);
    page.appear_after.lock().unwrap().insert("#late".into(), 3);
    let registry = fast_registry();
    registry
        .execute(&page, "click", &json!({"selector": "#late"}))
        .await
        .unwrap();
    assert_eq!(page.calls(), vec!["click #late force=true"]);
}

#[tokio::test]
async fn test_missing_element_reports_selector_not_found() {
    let page = FakePage::default();
    let registry = fast_registry();
    let err = registry
        .execute(&page, "click", &json!({"selector": "#nope"}))
        .await
        .unwrap_err();
    assert_eq!(err, AutomationError::SelectorNotFound("#nope".into()));
    assert!(page.lookups.load(Ordering::SeqCst) > 1, "should have polled");
}

#[tokio::test]
async fn test_hanging_operation_times_out() {
    let page = FakePage {
        hang_on_click: true,
        ..FakePage::with(&[("#go", "button")])
    };
    let registry = fast_registry();
    let err = registry
        .execute(&page, "click", &json!({"selector": "#go"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_input_into_select_is_skipped() {
    let page = FakePage::with(&[("#country", "select")]);
    let registry = fast_registry();
    let outcome = registry
        .execute(&page, "input", &json!({"selector": "#country", "text": "NL"}))
        .await
        .unwrap();
    assert!(outcome.skipped);
    assert!(page.calls().is_empty());
}

#[tokio::test]
async fn test_input_fills_text_controls() {
    let page = FakePage::with(&[("#q", "input")]);
    let registry = fast_registry();
    registry
        .execute(&page, "input", &json!({"selector": "#q", "text": "rust"}))
        .await
        .unwrap();
    assert_eq!(page.calls(), vec!["fill #q rust"]);
}

#[tokio::test]
async fn test_select_press_scroll_navigate() {
    let page = FakePage::with(&[("#c", "select"), ("#q", "input")]);
    let registry = fast_registry();
    registry
        .execute(&page, "selectChange", &json!({"selector": "#c", "text": "Germany"}))
        .await
        .unwrap();
    registry
        .execute(&page, "keyPress", &json!({"selector": "#q", "key": "Enter"}))
        .await
        .unwrap();
    registry
        .execute(&page, "scroll", &json!({"deltaX": 0, "deltaY": 250}))
        .await
        .unwrap();
    registry
        .execute(&page, "navigate", &json!({"url": "https://example.com/next"}))
        .await
        .unwrap();
    assert_eq!(
        page.calls(),
        vec![
            "select #c Germany",
            "press #q Enter",
            "scroll 0 250",
            "goto https://example.com/next",
        ]
    );
}

#[tokio::test]
async fn test_invalid_params_never_touch_the_page() {
    let page = FakePage::with(&[("#go", "button")]);
    let registry = fast_registry();
    let err = registry
        .execute(&page, "click", &json!({"selector": "#go", "force": true}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    assert!(!err.is_execution_failure());
    assert_eq!(page.lookups.load(Ordering::SeqCst), 0);
}
