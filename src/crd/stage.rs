//! Stage Custom Resource Definition
//!
//! A Stage is one declarative rule of the simulated lifecycle: a selector
//! deciding which resources it applies to, an optional delay, and the
//! mutation to perform (status patch, deletion, finalizer change, event).
//! The controller compiles Stages into a lifecycle state machine and replays
//! matching resources through it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Stage
///
/// Exactly one of `next.statusTemplate` / `next.statusPatchAsJSON` may be
/// set; a Stage with neither only performs its side effects (event, delete,
/// finalizer changes).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kwok.x-k8s.io",
    version = "v1alpha1",
    kind = "Stage",
    plural = "stages",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.resourceRef.kind"}"#,
    printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".spec.weight"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    /// The kind of resource this Stage applies to
    pub resource_ref: StageResourceRef,

    /// Which resources of that kind the Stage matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<StageSelector>,

    /// Tiebreaker when multiple Stages match; highest wins
    #[serde(default)]
    pub weight: i32,

    /// How long to wait before applying the Stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<StageDelay>,

    /// The mutation to apply when the Stage fires
    #[serde(default)]
    pub next: StageNext,

    /// Re-dispatch the resource immediately after this Stage applies,
    /// without waiting for the next watch event
    #[serde(default)]
    pub immediate_next_stage: bool,
}

/// Reference to the resource kind a Stage operates on
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageResourceRef {
    /// API group of the resource (core group is `v1`)
    #[serde(default = "default_api_group")]
    pub api_group: String,
    /// Kind of the resource (`Node` or `Pod`)
    pub kind: String,
}

fn default_api_group() -> String {
    "v1".to_string()
}

impl Default for StageResourceRef {
    fn default() -> Self {
        Self {
            api_group: default_api_group(),
            kind: String::new(),
        }
    }
}

/// Selector deciding which resources a Stage matches
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageSelector {
    /// Labels that must all be present with the given values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// Annotations that must all be present with the given values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_annotations: Option<BTreeMap<String, String>>,

    /// Requirements over dotted-path fields of the resource JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

/// One requirement over a dotted-path field (e.g. `.status.phase`)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Dotted path into the resource JSON, starting with `.`
    pub key: String,
    /// How the extracted value relates to `values`
    pub operator: SelectorOperator,
    /// Operand values for `In`/`NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Operator for a [`SelectorRequirement`]
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    /// Extracted value is one of `values`
    In,
    /// Extracted value is none of `values`
    NotIn,
    /// The field resolves to a non-empty value
    Exists,
    /// The field is absent or empty
    DoesNotExist,
}

/// Delay before a Stage fires
///
/// The effective delay is `base + uniform(0, jitter)`, with the base
/// clamped non-negative. `durationFrom` reads a timestamp out of the
/// resource and uses `target - now` as the base.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageDelay {
    /// Fixed base delay in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_milliseconds: Option<i64>,

    /// Dotted path to an RFC3339 timestamp used as the delay target;
    /// takes precedence over `durationMilliseconds` when it resolves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_from: Option<String>,

    /// Width in milliseconds of the uniform jitter window added to the base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_duration_milliseconds: Option<i64>,
}

/// The mutation a Stage applies when it fires
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageNext {
    /// Event to record on the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<StageEvent>,

    /// Finalizer changes applied before any deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<StageFinalizers>,

    /// Delete the resource (grace period zero)
    #[serde(default)]
    pub delete: bool,

    /// Template rendered against the resource and merged over `.status`.
    /// Mutually exclusive with `statusPatchAsJSON`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_template: Option<String>,

    /// JSON merge patch applied to `.status`.
    /// Mutually exclusive with `statusTemplate`.
    #[serde(rename = "statusPatchAsJSON", default, skip_serializing_if = "Option::is_none")]
    pub status_patch_as_json: Option<serde_json::Value>,

    /// Subresource the status patch targets; only `status` is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_subresource: Option<String>,
}

/// Event recorded when a Stage fires
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    /// `Normal` or `Warning`; defaults to `Normal`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Machine-readable reason, surfaced verbatim in the Event
    pub reason: String,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Finalizer changes applied by a Stage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageFinalizers {
    /// Finalizers to append if absent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    /// Finalizers to strip if present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    /// Remove every finalizer, letting an in-progress deletion complete
    #[serde(default)]
    pub empty: bool,
}

impl StageFinalizers {
    /// True if this change would leave finalizers untouched
    pub fn is_noop(&self) -> bool {
        !self.empty && self.add.is_empty() && self.remove.is_empty()
    }
}
