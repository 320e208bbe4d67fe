use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("static regex")
    })
}

/// Substitute `{{ name }}` and `{{ name.path }}` placeholders in every string of `config`.
///
/// A string that is exactly one placeholder takes the variable's JSON value
/// as-is; placeholders embedded in longer text are rendered as text. Unknown
/// names are left untouched.
pub fn resolve_config(config: &Value, variables: &BTreeMap<String, Value>) -> Value {
    match config {
        Value::String(s) => resolve_string(s, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_config(v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_config(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, variables: &BTreeMap<String, Value>) -> Value {
    let re = placeholder_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).is_some_and(|m| m.as_str().len() == s.len()) {
            if let Some(value) = lookup(&caps[1], variables) {
                return value.clone();
            }
        }
    }

    let rendered = re.replace_all(s, |caps: &Captures<'_>| match lookup(&caps[1], variables) {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => {
            debug!(placeholder = &caps[1], "Unresolved config placeholder");
            caps[0].to_string()
        }
    });
    Value::String(rendered.into_owned())
}

fn lookup<'a>(path: &str, variables: &'a BTreeMap<String, Value>) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
