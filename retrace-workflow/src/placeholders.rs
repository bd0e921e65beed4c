//! `{{name}}` substitution of workflow inputs into step params and tasks.
//!
//! A string that is exactly one placeholder takes the input's JSON value, so
//! `"{{count}}"` can become a number. Placeholders embedded in longer text are
//! replaced by the input rendered as a string. Dotted names address nested
//! input objects. A backslash in front of a placeholder (`\{{name}}`) keeps it
//! as literal text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\)?\{\{\s*([a-zA-Z0-9_.-]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// A substituted value together with the placeholder names that had no input.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution<T> {
    pub value: T,
    pub unresolved: Vec<String>,
}

impl<T> Substitution<T> {
    pub fn new(value: T, unresolved: Vec<String>) -> Self {
        Self { value, unresolved }
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

fn lookup<'a>(inputs: &'a Value, name: &str) -> Option<&'a Value> {
    let pointer = format!("/{}", name.replace('.', "/"));
    inputs.pointer(&pointer).filter(|v| !v.is_null())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace placeholders in every string inside `value`, returning the names
/// that could not be resolved. Unresolved placeholders are left in place.
pub fn substitute(value: &mut Value, inputs: &Value) -> Vec<String> {
    let mut unresolved = Vec::new();
    substitute_into(value, inputs, &mut unresolved);
    unresolved
}

/// Substitute into step params. A string field for which `as_text` holds
/// always stays a string; other fields follow [`substitute`].
pub fn substitute_params(
    params: &mut Map<String, Value>,
    inputs: &Value,
    as_text: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut unresolved = Vec::new();
    for (name, value) in params.iter_mut() {
        match value {
            Value::String(s) if as_text(name) => {
                let substituted = substitute_str(s, inputs);
                unresolved.extend(substituted.unresolved);
                *s = substituted.value;
            }
            other => substitute_into(other, inputs, &mut unresolved),
        }
    }
    unresolved
}

fn substitute_into(value: &mut Value, inputs: &Value, unresolved: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_into(v, inputs, unresolved);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_into(v, inputs, unresolved);
            }
        }
        Value::String(s) => {
            if let Some(name) = whole_placeholder(s).map(str::to_string) {
                match lookup(inputs, &name) {
                    Some(replacement) => *value = replacement.clone(),
                    None => unresolved.push(name),
                }
                return;
            }
            let substituted = substitute_str(s, inputs);
            unresolved.extend(substituted.unresolved);
            *s = substituted.value;
        }
        _ => {}
    }
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(s)?;
    let whole = caps.get(0)?;
    if caps.get(1).is_none() && whole.start() == 0 && whole.end() == s.len() {
        caps.get(2).map(|m| m.as_str())
    } else {
        None
    }
}

/// Replace placeholders inside free text. The result is always a string.
pub fn substitute_str(text: &str, inputs: &Value) -> Substitution<String> {
    let mut unresolved = Vec::new();
    let value = PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if caps.get(1).is_some() {
                return caps[0][1..].to_string();
            }
            let name = &caps[2];
            match lookup(inputs, name) {
                Some(v) => render(v),
                None => {
                    unresolved.push(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    Substitution::new(value, unresolved)
}

/// Append the placeholder names found in any string inside `value`.
pub fn collect(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::Object(map) => map.values().for_each(|v| collect(v, names)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, names)),
        Value::String(s) => collect_str(s, names),
        _ => {}
    }
}

pub fn collect_str(text: &str, names: &mut Vec<String>) {
    for caps in PLACEHOLDER.captures_iter(text) {
        if caps.get(1).is_none() {
            names.push(caps[2].to_string());
        }
    }
}

/// Protect text that must be replayed verbatim: every placeholder-shaped run
/// gets a leading backslash, which substitution strips again.
pub fn escape(text: &str) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| format!("\\{}", &caps[0]))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let mut params = json!({"deltaY": "{{distance}}", "selector": "#list"});
        let unresolved = substitute(&mut params, &json!({"distance": 400}));
        assert!(unresolved.is_empty());
        assert_eq!(params, json!({"deltaY": 400, "selector": "#list"}));
    }

    #[test]
    fn test_partial_placeholder_renders_string() {
        let out = substitute_str(
            "https://example.com/?q={{ term }}&n={{count}}",
            &json!({"term": "rust", "count": 3}),
        );
        assert!(out.is_complete());
        assert_eq!(out.value, "https://example.com/?q=rust&n=3");
    }

    #[test]
    fn test_nested_names() {
        let out = substitute_str("Hello {{user.name}}", &json!({"user": {"name": "Ada"}}));
        assert_eq!(out.value, "Hello Ada");
    }

    #[test]
    fn test_unresolved_left_in_place() {
        let mut params = json!({"text": "{{missing}}", "other": ["a {{gone}} b"]});
        let mut unresolved = substitute(&mut params, &json!({"missing": null}));
        unresolved.sort();
        assert_eq!(unresolved, vec!["gone".to_string(), "missing".to_string()]);
        assert_eq!(params["text"], json!("{{missing}}"));
        assert_eq!(params["other"][0], json!("a {{gone}} b"));
    }

    #[test]
    fn test_text_params_stay_strings() {
        let mut params = Map::new();
        params.insert("text".into(), json!("{{qty}}"));
        params.insert("deltaY".into(), json!("{{qty}}"));
        let unresolved = substitute_params(&mut params, &json!({"qty": 3}), |name| name == "text");
        assert!(unresolved.is_empty());
        assert_eq!(params["text"], json!("3"));
        assert_eq!(params["deltaY"], json!(3));
    }

    #[test]
    fn test_escaped_placeholders_are_literal() {
        let recorded = "type {{name}} here, or \\{{x}}";
        let escaped = escape(recorded);
        let mut names = Vec::new();
        collect_str(&escaped, &mut names);
        assert!(names.is_empty());

        let out = substitute_str(&escaped, &json!({}));
        assert!(out.is_complete());
        assert_eq!(out.value, recorded);

        let mut value = json!(escape("{{name}}"));
        assert!(substitute(&mut value, &json!({"name": "Ada"})).is_empty());
        assert_eq!(value, json!("{{name}}"));
    }

    #[test]
    fn test_collect() {
        let mut names = Vec::new();
        collect(&json!({"a": "{{x}} and {{y}}", "b": [{"c": "{{z}}"}], "d": 1}), &mut names);
        names.sort();
        assert_eq!(names, vec!["x", "y", "z"]);
    }
}
