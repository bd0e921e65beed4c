//! Scripts evaluated in the page by [`crate::BridgePage`].
//!
//! Every element script resolves its target through `__retraceFind`, which
//! accepts CSS selectors as well as XPath expressions (`/html/...`,
//! `id("x")/div[1]` or an explicit `xpath=` prefix). Scripts return an object
//! shaped `{ ok: bool, reason?: string, value?: any }`.

use serde_json::Value;

use crate::AutomationError;

const FIND_HELPER: &str = r#"
const __retraceFind = (s) => {
  const isXPath = s.startsWith('xpath=') || s.startsWith('/') || s.startsWith('(') || s.startsWith('id(');
  if (isXPath) {
    const expr = s.startsWith('xpath=') ? s.slice(6) : s;
    return document.evaluate(expr, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
  }
  return document.querySelector(s);
};
"#;

/// Encode a Rust string as a JavaScript string literal.
fn js_string(value: &str) -> String {
    // JSON string literals are valid JavaScript string literals.
    Value::String(value.to_string()).to_string()
}

fn with_element(selector: &str, body: &str) -> String {
    format!(
        r#"(() => {{
{FIND_HELPER}
  const el = __retraceFind({sel});
  if (!el) return {{ ok: false, reason: 'not_found' }};
{body}
}})()"#,
        sel = js_string(selector),
    )
}

pub fn element_tag(selector: &str) -> String {
    with_element(
        selector,
        "  return { ok: true, value: el.tagName.toLowerCase() };",
    )
}

pub fn click(selector: &str, force: bool) -> String {
    let body = if force {
        "  el.click();\n  return { ok: true };".to_string()
    } else {
        r#"  const r = el.getBoundingClientRect();
  const top = document.elementFromPoint(r.left + r.width / 2, r.top + r.height / 2);
  if (top && top !== el && !el.contains(top)) return { ok: false, reason: 'obscured' };
  el.click();
  return { ok: true };"#
            .to_string()
    };
    with_element(selector, &body)
}

pub fn fill(selector: &str, text: &str) -> String {
    let body = format!(
        r#"  el.focus();
  const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const setter = Object.getOwnPropertyDescriptor(proto, 'value');
  if (setter && setter.set && ('value' in el)) {{ setter.set.call(el, {text}); }}
  else if (el.isContentEditable) {{ el.textContent = {text}; }}
  else {{ return {{ ok: false, reason: 'not_editable' }}; }}
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return {{ ok: true }};"#,
        text = js_string(text),
    );
    with_element(selector, &body)
}

pub fn select_option_by_text(selector: &str, text: &str) -> String {
    let body = format!(
        r#"  if (el.tagName !== 'SELECT') return {{ ok: false, reason: 'not_a_select' }};
  const wanted = {text};
  const opt = Array.from(el.options).find(o => o.text.trim() === wanted.trim());
  if (!opt) return {{ ok: false, reason: 'option_not_found' }};
  el.value = opt.value;
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return {{ ok: true, value: opt.value }};"#,
        text = js_string(text),
    );
    with_element(selector, &body)
}

pub fn press(selector: &str, key: &str) -> String {
    let body = format!(
        r#"  el.focus();
  const raw = {key};
  const parts = raw.split('+');
  const k = parts[parts.length - 1];
  const mods = parts.slice(0, -1);
  const isMac = navigator.platform.toUpperCase().includes('MAC');
  const init = {{
    key: k, bubbles: true, cancelable: true,
    ctrlKey: mods.includes('Ctrl') || (mods.includes('CmdOrCtrl') && !isMac),
    metaKey: mods.includes('Meta') || (mods.includes('CmdOrCtrl') && isMac),
    shiftKey: mods.includes('Shift'), altKey: mods.includes('Alt'),
  }};
  el.dispatchEvent(new KeyboardEvent('keydown', init));
  el.dispatchEvent(new KeyboardEvent('keyup', init));
  if (k === 'Enter' && el.form && typeof el.form.requestSubmit === 'function') el.form.requestSubmit();
  return {{ ok: true }};"#,
        key = js_string(key),
    );
    with_element(selector, &body)
}

pub fn scroll_by(delta_x: i64, delta_y: i64) -> String {
    format!("(() => {{ window.scrollBy({delta_x}, {delta_y}); return {{ ok: true }}; }})()")
}

pub fn navigate(url: &str) -> String {
    format!(
        "(() => {{ window.location.href = {}; return {{ ok: true }}; }})()",
        js_string(url)
    )
}

pub fn current_url() -> &'static str {
    "(() => ({ ok: true, value: window.location.href }))()"
}

/// Interpret the `{ ok, reason, value }` object returned by an element script.
pub fn interpret(selector: &str, result: Value) -> Result<Value, AutomationError> {
    let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok {
        return Ok(result.get("value").cloned().unwrap_or(Value::Null));
    }
    let reason = result
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match reason {
        "not_found" => Err(AutomationError::SelectorNotFound(selector.to_string())),
        other => Err(AutomationError::PageError(format!(
            "{other} while operating on '{selector}'"
        ))),
    }
}
