//! Client-side label-selector matching
//!
//! The API server only filters watches by label selector; annotation
//! selectors and the disregard selectors are evaluated locally against
//! object metadata. Supports the common selector forms: `k=v`, `k==v`,
//! `k!=v`, bare `k` (exists), `!k` (not exists), comma-separated.

use std::collections::BTreeMap;

use crate::error::Error;

/// A parsed selector over a label/annotation map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Selector {
    /// Parse a selector string; empty input selects everything.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        for term in input.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let req = if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once("==") {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once('=') {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else if let Some(key) = term.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            match &req {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k)
                    if k.is_empty() =>
                {
                    return Err(Error::config(format!("invalid selector term {term:?}")))
                }
                _ => {}
            }
            requirements.push(req);
        }
        Ok(Self { requirements })
    }

    /// True if this selector has no requirements (matches everything)
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against a metadata map
    pub fn matches(&self, meta: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => meta.get(k) == Some(v),
            Requirement::NotEquals(k, v) => meta.get(k) != Some(v),
            Requirement::Exists(k) => meta.contains_key(k),
            Requirement::NotExists(k) => !meta.contains_key(k),
        })
    }
}
