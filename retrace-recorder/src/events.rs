use serde::{Deserialize, Serialize};

use crate::{RecorderError, Result};

/// A raw interaction event as produced by the capture script.
///
/// Which optional fields are present depends on `event_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// Recognised raw event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Navigation,
    Click,
    Input,
    SelectChange,
    KeyPress,
    Scroll,
    /// Tab bookkeeping; never produces a step.
    TabUpdated,
}

impl CaptureKind {
    pub fn parse(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "navigation" | "navigate" => CaptureKind::Navigation,
            "click" => CaptureKind::Click,
            "input" => CaptureKind::Input,
            "select_change" | "select" => CaptureKind::SelectChange,
            "key_press" | "keypress" => CaptureKind::KeyPress,
            "scroll_update" | "scroll" => CaptureKind::Scroll,
            "tabUpdated" | "tab_updated" => CaptureKind::TabUpdated,
            _ => return None,
        })
    }

    /// Kinds that count as a genuine user interaction when trimming lead noise.
    pub fn is_interaction(self) -> bool {
        matches!(
            self,
            CaptureKind::Input | CaptureKind::Click | CaptureKind::Scroll
        )
    }
}

impl CaptureEvent {
    pub fn kind(&self) -> Option<CaptureKind> {
        CaptureKind::parse(&self.event_type)
    }

    /// CSS selector when captured, XPath otherwise. Empty strings count as absent.
    pub fn selector(&self) -> Option<&str> {
        self.css_selector
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.xpath.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Type-specific part of a [`Step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StepKind {
    Navigation,
    Click {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_text: Option<String>,
    },
    Input {
        selector: String,
        value: String,
    },
    SelectChange {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selected_value: Option<String>,
        selected_text: String,
    },
    KeyPress {
        selector: String,
        key: String,
    },
    Scroll {
        scroll_x: i64,
        scroll_y: i64,
    },
}

impl StepKind {
    /// Wire name of the step type.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Navigation => "navigation",
            StepKind::Click { .. } => "click",
            StepKind::Input { .. } => "input",
            StepKind::SelectChange { .. } => "selectChange",
            StepKind::KeyPress { .. } => "keyPress",
            StepKind::Scroll { .. } => "scroll",
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            StepKind::Click { selector, .. }
            | StepKind::Input { selector, .. }
            | StepKind::SelectChange { selector, .. }
            | StepKind::KeyPress { selector, .. } => Some(selector),
            StepKind::Navigation | StepKind::Scroll { .. } => None,
        }
    }
}

/// A canonical recorded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 1-based position in the owning list; maintained by [`StepList`].
    pub step_number: usize,
    pub timestamp: i64,
    pub url: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(timestamp: i64, url: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_number: 0,
            timestamp,
            url: url.into(),
            kind,
        }
    }

    pub fn navigation(timestamp: i64, url: impl Into<String>) -> Self {
        Self::new(timestamp, url, StepKind::Navigation)
    }

    pub fn selector(&self) -> Option<&str> {
        self.kind.selector()
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self.kind, StepKind::Navigation)
    }
}

/// What a caller believes sits at a list position before asking to move it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExpectation {
    pub action: String,
    #[serde(default)]
    pub selector: Option<String>,
}

impl StepExpectation {
    fn matches(&self, step: &Step) -> bool {
        step.kind.label() == self.action && step.selector() == self.selector.as_deref()
    }
}

/// Ordered steps whose `step_number`s are always `1..=len`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepList {
    steps: Vec<Step>,
}

impl StepList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        let mut list = Self { steps };
        list.renumber();
        list
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn as_slice(&self) -> &[Step] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// URL of the most recent step, if any.
    pub fn last_url(&self) -> Option<&str> {
        self.steps.last().map(|s| s.url.as_str())
    }

    /// True when the list holds nothing worth persisting: no steps, or only
    /// the synthetic opening navigation.
    pub fn is_trivial(&self) -> bool {
        match self.steps.as_slice() {
            [] => true,
            [only] => only.is_navigation(),
            _ => false,
        }
    }

    pub fn push(&mut self, mut step: Step) -> &Step {
        step.step_number = self.steps.len() + 1;
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    /// Mutable access to the newest step. Its `step_number` must not change.
    pub(crate) fn last_mut(&mut self) -> Option<&mut Step> {
        self.steps.last_mut()
    }

    pub fn pop(&mut self) -> Option<Step> {
        self.steps.pop()
    }

    pub fn delete(&mut self, index: usize) -> Result<Step> {
        if index >= self.steps.len() {
            return Err(RecorderError::Protocol(format!(
                "cannot delete step {index}: only {} steps recorded",
                self.steps.len()
            )));
        }
        let removed = self.steps.remove(index);
        self.renumber();
        Ok(removed)
    }

    /// Move the step at `original_index` to `new_index`. Nothing changes when
    /// either index is out of range or the step there is not the expected one.
    pub fn reorder(
        &mut self,
        original_index: usize,
        new_index: usize,
        expected: &StepExpectation,
    ) -> Result<()> {
        let len = self.steps.len();
        if original_index >= len || new_index >= len {
            return Err(RecorderError::Protocol(format!(
                "cannot move step {original_index} to {new_index}: only {len} steps recorded"
            )));
        }
        if !expected.matches(&self.steps[original_index]) {
            return Err(RecorderError::Protocol(format!(
                "step {original_index} is not {} {}; refusing to reorder",
                expected.action,
                expected.selector.as_deref().unwrap_or("")
            )));
        }
        let step = self.steps.remove(original_index);
        self.steps.insert(new_index, step);
        self.renumber();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn to_vec(&self) -> Vec<Step> {
        self.steps.clone()
    }

    fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.step_number = i + 1;
        }
    }
}

/// A finished recording as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    /// RFC 3339 time of the save.
    pub timestamp: String,
    pub name: String,
    pub total_steps: usize,
    pub description: String,
    pub steps: Vec<Step>,
}

impl RecordingFile {
    pub fn new(name: impl Into<String>, description: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            name: name.into(),
            total_steps: steps.len(),
            description: description.into(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn click(sel: &str) -> Step {
        Step::new(
            1,
            "https://example.com/",
            StepKind::Click {
                selector: sel.into(),
                element_tag: None,
                element_text: None,
            },
        )
    }

    fn numbers(list: &StepList) -> Vec<usize> {
        list.iter().map(|s| s.step_number).collect()
    }

    #[test]
    fn test_step_serializes_flat_with_type_tag() {
        let mut list = StepList::new();
        list.push(Step::new(
            42,
            "https://example.com/",
            StepKind::SelectChange {
                selector: "#country".into(),
                selected_value: Some("de".into()),
                selected_text: "Germany".into(),
            },
        ));
        let value = serde_json::to_value(&list.as_slice()[0]).unwrap();
        assert_eq!(
            value,
            json!({
                "stepNumber": 1,
                "timestamp": 42,
                "url": "https://example.com/",
                "type": "selectChange",
                "selector": "#country",
                "selectedValue": "de",
                "selectedText": "Germany",
            })
        );
        let back: Step = serde_json::from_value(value).unwrap();
        assert_eq!(back, list.as_slice()[0]);
    }

    #[test]
    fn test_delete_then_push_stays_dense() {
        let mut list = StepList::new();
        for sel in ["#a", "#b", "#c", "#d"] {
            list.push(click(sel));
        }
        list.delete(1).unwrap();
        list.delete(0).unwrap();
        list.push(click("#e"));
        assert_eq!(numbers(&list), vec![1, 2, 3]);
        list.delete(2).unwrap();
        list.delete(1).unwrap();
        list.delete(0).unwrap();
        assert!(list.is_empty());
        assert!(list.delete(0).is_err());
        list.push(click("#f"));
        assert_eq!(numbers(&list), vec![1]);
    }

    #[test]
    fn test_reorder_moves_and_renumbers() {
        let mut list = StepList::new();
        for sel in ["#a", "#b", "#c"] {
            list.push(click(sel));
        }
        let expected = StepExpectation {
            action: "click".into(),
            selector: Some("#c".into()),
        };
        list.reorder(2, 0, &expected).unwrap();
        let selectors: Vec<_> = list.iter().filter_map(|s| s.selector()).collect();
        assert_eq!(selectors, vec!["#c", "#a", "#b"]);
        assert_eq!(numbers(&list), vec![1, 2, 3]);
    }

    #[test]
    fn test_reorder_mismatch_leaves_list_unchanged() {
        let mut list = StepList::new();
        for sel in ["#a", "#b", "#c"] {
            list.push(click(sel));
        }
        let before = list.clone();
        let wrong = StepExpectation {
            action: "click".into(),
            selector: Some("#b".into()),
        };
        assert!(list.reorder(0, 2, &wrong).is_err());
        assert!(list.reorder(0, 7, &wrong).is_err());
        assert_eq!(list, before);
    }

    #[test]
    fn test_trivial_lists() {
        let mut list = StepList::new();
        assert!(list.is_trivial());
        list.push(Step::navigation(1, "https://example.com/"));
        assert!(list.is_trivial());
        list.push(click("#a"));
        assert!(!list.is_trivial());
    }

    #[test]
    fn test_capture_kind_aliases() {
        assert_eq!(CaptureKind::parse("navigate"), Some(CaptureKind::Navigation));
        assert_eq!(CaptureKind::parse("keypress"), Some(CaptureKind::KeyPress));
        assert_eq!(CaptureKind::parse("tab_updated"), Some(CaptureKind::TabUpdated));
        assert_eq!(CaptureKind::parse("hover"), None);
    }

    #[test]
    fn test_selector_prefers_css_then_xpath() {
        let event = CaptureEvent {
            event_type: "click".into(),
            css_selector: Some(String::new()),
            xpath: Some("/html/body/button".into()),
            ..Default::default()
        };
        assert_eq!(event.selector(), Some("/html/body/button"));
    }
}
