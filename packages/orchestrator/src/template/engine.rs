//! `{{ expr }}` rendering against a variable map.
//!
//! Expressions are dotted paths (`book_titles.count`). Array segments accept
//! numeric indexes plus the `count`/`length` pseudo-fields. A string that is
//! exactly one placeholder substitutes the raw JSON value, preserving lists
//! and objects; embedded placeholders render to strings. Missing variables
//! render as the empty string.

use serde_json::{Map, Value};

/// Resolve a dotted path against the variable map.
pub fn lookup_path(vars: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current: Value = vars.get(first)?.clone();
    for segment in segments {
        current = match &current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => {
                if segment == "count" || segment == "length" {
                    Value::from(items.len() as u64)
                } else {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?.clone()
                }
            }
            Value::String(s) if segment == "count" || segment == "length" => {
                Value::from(s.chars().count() as u64)
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Render a JSON value as template output text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render all `{{ expr }}` placeholders in `template` to a string.
pub fn render_str(template: &str, vars: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let expr = after_open[..close].trim();
                if let Some(value) = lookup_path(vars, expr) {
                    out.push_str(&value_to_string(&value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated placeholder; emit verbatim
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// True when the string is exactly one `{{ expr }}` placeholder.
fn sole_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Deep-render a JSON value: every string has its placeholders substituted;
/// a string that is a single placeholder takes the raw variable value.
pub fn render_value(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(template) => {
            if let Some(expr) = sole_placeholder(template) {
                return lookup_path(vars, expr).unwrap_or(Value::String(String::new()));
            }
            Value::String(render_str(template, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), render_value(val, vars));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
