//! Status template rendering
//!
//! `next.statusTemplate` bodies are minijinja templates rendered against the
//! full resource object, then parsed as YAML and merged over `.status`.
//! The helper set mirrors the one stage authors rely on:
//!
//! - `Now()`: current time, RFC3339 with nanoseconds
//! - `StartTime()`: process start time, same format
//! - `Version()`: controller version
//! - `| quote`: JSON-quote a value
//! - `| yaml` / `| yaml(indent)`: render a value as a YAML body

use chrono::{SecondsFormat, Utc};
use minijinja::{Environment, UndefinedBehavior};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::Error;
use crate::yamlconv;

static START_TIME: Lazy<String> = Lazy::new(now_rfc3339);

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Renders status templates and applies status patches
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a renderer with the standard helper set installed
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Stage templates routinely probe fields that are absent on young
        // resources; lenient lookups keep them renderable.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_function("Now", now_rfc3339);
        env.add_function("StartTime", || START_TIME.clone());
        env.add_function("Version", || env!("CARGO_PKG_VERSION").to_string());

        env.add_filter("quote", quote_filter);
        env.add_filter("yaml", yaml_filter);

        Self { env }
    }

    /// Render a status template against the resource object and parse the
    /// result as the status patch value.
    pub fn render_status(&self, template: &str, resource: &Value) -> Result<Value, Error> {
        let rendered = self.env.render_str(template, resource)?;
        yamlconv::parse_yaml(&rendered)
    }
}

fn quote_filter(value: minijinja::Value) -> Result<String, minijinja::Error> {
    // Absent fields quote to the empty string, matching how lenient
    // rendering treats them everywhere else.
    if value.is_undefined() || value.is_none() {
        return Ok("\"\"".to_string());
    }
    let json = serde_json::to_value(&value)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_else(|_| format!("{value}"));
    if json.starts_with('"') {
        Ok(json)
    } else {
        Ok(format!("{json:?}"))
    }
}

fn yaml_filter(
    value: minijinja::Value,
    indent: Option<usize>,
) -> Result<String, minijinja::Error> {
    let json: Value = serde_json::to_value(&value).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })?;
    let body = yamlconv::emit_yaml(&json).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })?;
    match indent {
        Some(n) if n > 0 => {
            let pad = " ".repeat(n * 2);
            Ok(format!("\n{body}").replace('\n', &format!("\n{pad}")))
        }
        _ => Ok(body),
    }
}

/// Apply a JSON merge patch over a value in place.
///
/// Objects merge recursively, `null` deletes the key, everything else
/// replaces. The same semantics the API server applies to the merge patch
/// we send, used locally for idempotence checks and immediate re-dispatch.
pub fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_value(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
