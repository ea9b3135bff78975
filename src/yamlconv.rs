//! YAML parsing utilities using yaml-rust2
//!
//! Config streams and rendered status templates arrive as YAML; everything
//! downstream works on `serde_json::Value`. This module converts in both
//! directions, using yaml-rust2 for parsing/emitting and serde_json for all
//! typed needs.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlEmitter, YamlLoader};

use crate::error::Error;

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a multi-document YAML string into a Vec of serde_json::Values.
///
/// Each YAML document separated by `---` becomes a separate Value.
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>, Error> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    docs.into_iter().map(yaml_to_json).collect()
}

/// Serialize a serde_json::Value as a YAML document body (no leading `---`).
pub fn emit_yaml(value: &Value) -> Result<String, Error> {
    let yaml = json_to_yaml(value);
    let mut out = String::new();
    let mut emitter = YamlEmitter::new(&mut out);
    emitter
        .dump(&yaml)
        .map_err(|e| Error::serialization(e.to_string()))?;
    // YamlEmitter always prefixes the document marker.
    Ok(out.trim_start_matches("---").trim_start().to_string())
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null | Yaml::BadValue => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s.parse().map_err(|e: std::num::ParseFloatError| {
                Error::serialization(e.to_string())
            })?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(hash) => {
            let mut map = Map::new();
            for (k, v) in hash {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Real(r) => r,
                    other => {
                        return Err(Error::serialization(format!(
                            "unsupported yaml key: {other:?}"
                        )))
                    }
                };
                map.insert(key, yaml_to_json(v)?);
            }
            Ok(Value::Object(map))
        }
        Yaml::Alias(_) => Err(Error::serialization("yaml aliases are not supported")),
    }
}

fn json_to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Yaml::Integer(i)
            } else {
                Yaml::Real(n.to_string())
            }
        }
        Value::String(s) => Yaml::String(s.clone()),
        Value::Array(arr) => Yaml::Array(arr.iter().map(json_to_yaml).collect()),
        Value::Object(map) => {
            let mut hash = yaml_rust2::yaml::Hash::new();
            for (k, v) in map {
                hash.insert(Yaml::String(k.clone()), json_to_yaml(v));
            }
            Yaml::Hash(hash)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_scalars_and_maps() {
        let v = parse_yaml("phase: Running\nready: true\nrestarts: 3\n").unwrap();
        assert_eq!(v, json!({"phase": "Running", "ready": true, "restarts": 3}));
    }

    #[test]
    fn empty_input_is_null() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
    }

    #[test]
    fn splits_multi_document_streams() {
        let docs = parse_yaml_multi("kind: KwokConfiguration\n---\nkind: Stage\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "KwokConfiguration");
        assert_eq!(docs[1]["kind"], "Stage");
    }

    #[test]
    fn nested_structures_round_trip() {
        let v = json!({
            "conditions": [
                {"type": "Ready", "status": "True"},
            ],
            "podIP": "10.0.0.2",
        });
        let emitted = emit_yaml(&v).unwrap();
        assert_eq!(parse_yaml(&emitted).unwrap(), v);
    }

    #[test]
    fn emitted_yaml_has_no_document_marker() {
        let out = emit_yaml(&json!({"a": 1})).unwrap();
        assert!(!out.starts_with("---"));
        assert!(out.contains("a: 1"));
    }
}
