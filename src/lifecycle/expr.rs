//! Dotted-path expressions over resource JSON
//!
//! Stage selectors and delays address fields of the watched resource with
//! `.`-separated paths (`.status.phase`, `.metadata.deletionTimestamp`).
//! A path that does not resolve reads as the empty string; `Exists` and
//! `DoesNotExist` respect that emptiness.

use serde_json::Value;

use crate::error::Error;

/// A compiled dotted-path expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    source: String,
    path: Vec<String>,
}

impl Expression {
    /// Compile a dotted path. The path must start with `.`; an empty
    /// segment anywhere is an error.
    pub fn parse(source: &str) -> Result<Self, Error> {
        let rest = source
            .strip_prefix('.')
            .ok_or_else(|| Error::Expr(source.to_string()))?;
        if rest.is_empty() {
            return Err(Error::Expr(source.to_string()));
        }
        let path: Vec<String> = rest.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(Error::Expr(source.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            path,
        })
    }

    /// The original path text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Resolve the path against a resource object, if present
    pub fn extract<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        let mut current = data;
        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve the path to a string for selector comparison.
    ///
    /// Absent fields and nulls read as `""`; scalars render without JSON
    /// quoting so `.status.phase` compares against plain `Running`.
    pub fn extract_string(&self, data: &Value) -> String {
        match self.extract(data) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }
}
