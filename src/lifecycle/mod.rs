//! Lifecycle state machine compiled from Stage rules
//!
//! A [`Lifecycle`] is an immutable snapshot of compiled [`LifecycleStage`]s
//! for one resource kind. Matching picks the single winning stage for a
//! resource (max weight, random tiebreak), delay sampling decides when it
//! fires, and applying produces the mutation outcome the controllers act on.

mod expr;
mod render;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;

use crate::crd::{
    SelectorOperator, Stage, StageEvent, StageFinalizers, StageNext,
};
use crate::error::Error;

pub use expr::Expression;
pub use render::{merge_value, TemplateRenderer};

/// Labels or annotations of a resource, as stored in object metadata
pub type MetaMap = BTreeMap<String, String>;

/// Immutable set of compiled stages for one resource kind
#[derive(Clone, Default)]
pub struct Lifecycle {
    stages: Vec<Arc<LifecycleStage>>,
}

impl Lifecycle {
    /// An empty lifecycle: nothing ever matches, nothing is mutated
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a lifecycle from already-compiled stages
    pub fn new(stages: Vec<Arc<LifecycleStage>>) -> Self {
        Self { stages }
    }

    /// Compile a set of Stage resources, failing on the first invalid one.
    ///
    /// Used for statically configured stages where a bad rule is a
    /// configuration error; the dynamic loader compiles stage-by-stage and
    /// skips invalid ones instead.
    pub fn compile(stages: &[Stage]) -> Result<Self, Error> {
        let compiled = stages
            .iter()
            .map(|s| LifecycleStage::compile(s).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(compiled))
    }

    /// Number of stages in this snapshot
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if this snapshot holds no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// All stages whose selectors match the resource
    pub fn list_all_possible(
        &self,
        labels: &MetaMap,
        annotations: &MetaMap,
        data: &Value,
    ) -> Vec<Arc<LifecycleStage>> {
        self.stages
            .iter()
            .filter(|s| s.matches(labels, annotations, data))
            .cloned()
            .collect()
    }

    /// The single winning stage for the resource, if any.
    ///
    /// Matching stages are filtered to the maximum weight; ties are broken
    /// uniformly at random so repeated executions spread load across
    /// equivalent stages.
    pub fn match_stage<R: Rng>(
        &self,
        labels: &MetaMap,
        annotations: &MetaMap,
        data: &Value,
        rng: &mut R,
    ) -> Option<Arc<LifecycleStage>> {
        let matching = self.list_all_possible(labels, annotations, data);
        let max_weight = matching.iter().map(|s| s.weight).max()?;
        let winners: Vec<_> = matching
            .into_iter()
            .filter(|s| s.weight == max_weight)
            .collect();
        match winners.len() {
            0 => None,
            1 => winners.into_iter().next(),
            n => winners.into_iter().nth(rng.gen_range(0..n)),
        }
    }
}

/// One compiled Stage rule
#[derive(Debug)]
pub struct LifecycleStage {
    name: String,
    weight: i32,
    match_labels: Option<MetaMap>,
    match_annotations: Option<MetaMap>,
    match_expressions: Vec<CompiledRequirement>,
    delay: Option<CompiledDelay>,
    next: StageNext,
    immediate_next_stage: bool,
}

#[derive(Debug)]
struct CompiledRequirement {
    expr: Expression,
    operator: SelectorOperator,
    values: Vec<String>,
}

#[derive(Debug)]
struct CompiledDelay {
    duration_ms: Option<i64>,
    duration_from: Option<Expression>,
    jitter_ms: Option<i64>,
}

/// What applying a stage asks the controller to do
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// Name of the stage that produced this outcome
    pub stage_name: String,
    /// Merge patch for `.status`, already rendered
    pub status_patch: Option<Value>,
    /// Event to record on the resource
    pub event: Option<StageEvent>,
    /// Delete the resource with grace period zero
    pub delete: bool,
    /// Finalizer changes to apply before anything else
    pub finalizers: Option<StageFinalizers>,
    /// Re-dispatch the resource immediately after a successful apply
    pub immediate_next: bool,
}

impl LifecycleStage {
    /// Compile a Stage resource into an immutable rule.
    ///
    /// Fails on: mutually exclusive `statusTemplate`/`statusPatchAsJSON`,
    /// unparseable dotted paths, unknown event type, unsupported status
    /// subresource.
    pub fn compile(stage: &Stage) -> Result<Self, Error> {
        let name = stage
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        let spec = &stage.spec;

        if spec.next.status_template.is_some() && spec.next.status_patch_as_json.is_some() {
            return Err(Error::invalid_stage(
                &name,
                "statusTemplate and statusPatchAsJSON are mutually exclusive",
            ));
        }
        if let Some(event) = &spec.next.event {
            if let Some(type_) = &event.type_ {
                if type_ != "Normal" && type_ != "Warning" {
                    return Err(Error::invalid_stage(
                        &name,
                        format!("unknown event type {type_:?}"),
                    ));
                }
            }
        }
        if let Some(sub) = &spec.next.status_subresource {
            if sub != "status" {
                return Err(Error::invalid_stage(
                    &name,
                    format!("unsupported status subresource {sub:?}"),
                ));
            }
        }

        let selector = spec.selector.clone().unwrap_or_default();
        let match_expressions = selector
            .match_expressions
            .unwrap_or_default()
            .into_iter()
            .map(|req| {
                Ok(CompiledRequirement {
                    expr: Expression::parse(&req.key)?,
                    operator: req.operator,
                    values: req.values,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let delay = spec
            .delay
            .as_ref()
            .map(|d| {
                Ok::<_, Error>(CompiledDelay {
                    duration_ms: d.duration_milliseconds,
                    duration_from: d
                        .duration_from
                        .as_deref()
                        .map(Expression::parse)
                        .transpose()?,
                    jitter_ms: d.jitter_duration_milliseconds,
                })
            })
            .transpose()?;

        Ok(Self {
            name,
            weight: spec.weight,
            match_labels: selector.match_labels,
            match_annotations: selector.match_annotations,
            match_expressions,
            delay,
            next: spec.next.clone(),
            immediate_next_stage: spec.immediate_next_stage,
        })
    }

    /// Name of the originating Stage resource
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tiebreaker weight
    pub fn weight(&self) -> i32 {
        self.weight
    }

    /// True if the stage asks for immediate re-dispatch after applying
    pub fn immediate_next_stage(&self) -> bool {
        self.immediate_next_stage
    }

    /// True if the selector matches the resource
    pub fn matches(&self, labels: &MetaMap, annotations: &MetaMap, data: &Value) -> bool {
        if let Some(required) = &self.match_labels {
            if !required.iter().all(|(k, v)| labels.get(k) == Some(v)) {
                return false;
            }
        }
        if let Some(required) = &self.match_annotations {
            if !required.iter().all(|(k, v)| annotations.get(k) == Some(v)) {
                return false;
            }
        }
        self.match_expressions.iter().all(|req| {
            let value = req.expr.extract_string(data);
            match req.operator {
                SelectorOperator::In => req.values.contains(&value),
                SelectorOperator::NotIn => !req.values.contains(&value),
                SelectorOperator::Exists => !value.is_empty(),
                SelectorOperator::DoesNotExist => value.is_empty(),
            }
        })
    }

    /// Sample the effective delay for this dispatch.
    ///
    /// `None` means no delay is configured and the caller applies
    /// immediately. A `durationFrom` timestamp in the past yields zero.
    pub fn delay<R: Rng>(&self, data: &Value, now: DateTime<Utc>, rng: &mut R) -> Option<Duration> {
        let delay = self.delay.as_ref()?;

        let base_ms = delay
            .duration_from
            .as_ref()
            .and_then(|expr| {
                let raw = expr.extract_string(data);
                DateTime::parse_from_rfc3339(&raw).ok()
            })
            .map(|target| (target.with_timezone(&Utc) - now).num_milliseconds())
            .or(delay.duration_ms);

        let (base_ms, jitter_ms) = match (base_ms, delay.jitter_ms) {
            (None, None) => return None,
            (base, jitter) => (base.unwrap_or(0).max(0), jitter),
        };

        let effective_ms = match jitter_ms {
            Some(jitter) if jitter > 0 => base_ms + rng.gen_range(0..jitter),
            _ => base_ms,
        };
        Some(Duration::from_millis(effective_ms as u64))
    }

    /// Compute the mutation outcome for a resource.
    ///
    /// Renders `statusTemplate` against the resource (or clones
    /// `statusPatchAsJSON`); never touches the API.
    pub fn apply(&self, resource: &Value, renderer: &TemplateRenderer) -> Result<StageOutcome, Error> {
        let status_patch = match (&self.next.status_template, &self.next.status_patch_as_json) {
            (Some(template), None) => Some(renderer.render_status(template, resource)?),
            (None, Some(patch)) => Some(patch.clone()),
            (None, None) => None,
            // Rejected at compile time.
            (Some(_), Some(_)) => unreachable!("mutually exclusive fields rejected at compile"),
        };

        Ok(StageOutcome {
            stage_name: self.name.clone(),
            status_patch,
            event: self.next.event.clone(),
            delete: self.next.delete,
            finalizers: self.next.finalizers.clone().filter(|f| !f.is_noop()),
            immediate_next: self.immediate_next_stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SelectorRequirement, StageDelay, StageSelector, StageSpec};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn stage(name: &str, spec: StageSpec) -> Stage {
        Stage::new(name, spec)
    }

    fn label_stage(name: &str, labels: &[(&str, &str)], weight: i32) -> Stage {
        stage(
            name,
            StageSpec {
                selector: Some(StageSelector {
                    match_labels: Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                weight,
                ..Default::default()
            },
        )
    }

    fn phase_stage(name: &str, phase: &str, template: &str) -> Stage {
        stage(
            name,
            StageSpec {
                selector: Some(StageSelector {
                    match_expressions: Some(vec![SelectorRequirement {
                        key: ".status.phase".into(),
                        operator: SelectorOperator::In,
                        values: vec![phase.into()],
                    }]),
                    ..Default::default()
                }),
                next: StageNext {
                    status_template: Some(template.into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn meta(pairs: &[(&str, &str)]) -> MetaMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn list_all_possible_filters_by_selector() {
        let lc = Lifecycle::compile(&[
            label_stage("a", &[("app", "web")], 0),
            label_stage("b", &[("app", "db")], 0),
        ])
        .unwrap();

        let possible = lc.list_all_possible(&meta(&[("app", "web")]), &meta(&[]), &json!({}));
        assert_eq!(possible.len(), 1);
        assert_eq!(possible[0].name(), "a");
    }

    #[test]
    fn match_picks_maximum_weight() {
        let lc = Lifecycle::compile(&[
            label_stage("light", &[("app", "web")], 1),
            label_stage("heavy", &[("app", "web")], 5),
        ])
        .unwrap();

        let chosen = lc
            .match_stage(&meta(&[("app", "web")]), &meta(&[]), &json!({}), &mut rng())
            .unwrap();
        assert_eq!(chosen.name(), "heavy");
    }

    #[test]
    fn match_is_deterministic_for_a_fixed_seed() {
        let stages: Vec<Stage> = (0..4)
            .map(|i| label_stage(&format!("s{i}"), &[("app", "web")], 3))
            .collect();
        let lc = Lifecycle::compile(&stages).unwrap();
        let labels = meta(&[("app", "web")]);

        let first = lc
            .match_stage(&labels, &meta(&[]), &json!({}), &mut rng())
            .unwrap();
        for _ in 0..10 {
            let again = lc
                .match_stage(&labels, &meta(&[]), &json!({}), &mut rng())
                .unwrap();
            assert_eq!(again.name(), first.name());
        }
    }

    #[test]
    fn match_returns_none_when_nothing_matches() {
        let lc = Lifecycle::compile(&[label_stage("a", &[("app", "web")], 0)]).unwrap();
        assert!(lc
            .match_stage(&meta(&[("app", "db")]), &meta(&[]), &json!({}), &mut rng())
            .is_none());
        assert!(Lifecycle::empty()
            .match_stage(&meta(&[]), &meta(&[]), &json!({}), &mut rng())
            .is_none());
    }

    #[test]
    fn expressions_on_missing_fields_follow_emptiness() {
        let requirement = |op, values: &[&str]| {
            stage(
                "s",
                StageSpec {
                    selector: Some(StageSelector {
                        match_expressions: Some(vec![SelectorRequirement {
                            key: ".status.phase".into(),
                            operator: op,
                            values: values.iter().map(|v| v.to_string()).collect(),
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
        };
        let compiled = |op, values: &[&str]| {
            LifecycleStage::compile(&requirement(op, values)).unwrap()
        };
        let empty_pod = json!({});

        // Missing field reads as "": In fails, NotIn matches.
        assert!(!compiled(SelectorOperator::In, &["Running"]).matches(
            &meta(&[]),
            &meta(&[]),
            &empty_pod
        ));
        assert!(compiled(SelectorOperator::NotIn, &["Running"]).matches(
            &meta(&[]),
            &meta(&[]),
            &empty_pod
        ));
        assert!(!compiled(SelectorOperator::Exists, &[]).matches(&meta(&[]), &meta(&[]), &empty_pod));
        assert!(compiled(SelectorOperator::DoesNotExist, &[]).matches(
            &meta(&[]),
            &meta(&[]),
            &empty_pod
        ));

        let running = json!({"status": {"phase": "Running"}});
        assert!(compiled(SelectorOperator::In, &["Running"]).matches(
            &meta(&[]),
            &meta(&[]),
            &running
        ));
        assert!(compiled(SelectorOperator::Exists, &[]).matches(&meta(&[]), &meta(&[]), &running));
    }

    #[test]
    fn delay_is_none_without_configuration() {
        let s = LifecycleStage::compile(&stage("s", StageSpec::default())).unwrap();
        assert!(s.delay(&json!({}), Utc::now(), &mut rng()).is_none());

        let s = LifecycleStage::compile(&stage(
            "s",
            StageSpec {
                delay: Some(StageDelay::default()),
                ..Default::default()
            },
        ))
        .unwrap();
        assert!(s.delay(&json!({}), Utc::now(), &mut rng()).is_none());
    }

    #[test]
    fn delay_samples_within_jitter_window() {
        // 1000ms base with a 500ms jitter window lands in [1000ms, 1500ms).
        let s = LifecycleStage::compile(&stage(
            "s",
            StageSpec {
                delay: Some(StageDelay {
                    duration_milliseconds: Some(1000),
                    jitter_duration_milliseconds: Some(500),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
        .unwrap();

        let mut r = rng();
        let mut jittered = false;
        for _ in 0..100 {
            let d = s.delay(&json!({}), Utc::now(), &mut r).unwrap();
            assert!(d >= Duration::from_millis(1000), "sampled {d:?}");
            assert!(d < Duration::from_millis(1500), "sampled {d:?}");
            jittered |= d > Duration::from_millis(1000);
        }
        assert!(jittered, "delay never left the base value");
    }

    #[test]
    fn jitter_alone_still_delays() {
        let s = LifecycleStage::compile(&stage(
            "s",
            StageSpec {
                delay: Some(StageDelay {
                    jitter_duration_milliseconds: Some(400),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
        .unwrap();
        let d = s.delay(&json!({}), Utc::now(), &mut rng()).unwrap();
        assert!(d < Duration::from_millis(400));
    }

    #[test]
    fn duration_from_reads_a_timestamp() {
        let s = LifecycleStage::compile(&stage(
            "s",
            StageSpec {
                delay: Some(StageDelay {
                    duration_from: Some(".metadata.deletionTimestamp".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
        .unwrap();
        let now = Utc::now();

        let future = json!({"metadata": {"deletionTimestamp":
            (now + chrono::Duration::seconds(30)).to_rfc3339()}});
        let d = s.delay(&future, now, &mut rng()).unwrap();
        assert!(d > Duration::from_secs(29) && d <= Duration::from_secs(30));

        // Past target clamps to zero instead of going negative.
        let past = json!({"metadata": {"deletionTimestamp":
            (now - chrono::Duration::seconds(30)).to_rfc3339()}});
        assert_eq!(s.delay(&past, now, &mut rng()).unwrap(), Duration::ZERO);
    }

    #[test]
    fn compile_rejects_conflicting_patch_fields() {
        let err = LifecycleStage::compile(&stage(
            "both",
            StageSpec {
                next: StageNext {
                    status_template: Some("phase: Running".into()),
                    status_patch_as_json: Some(json!({"phase": "Running"})),
                    ..Default::default()
                },
                ..Default::default()
            },
        ))
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn compile_rejects_bad_expressions_and_events() {
        let bad_expr = stage(
            "expr",
            StageSpec {
                selector: Some(StageSelector {
                    match_expressions: Some(vec![SelectorRequirement {
                        key: "status.phase".into(),
                        operator: SelectorOperator::Exists,
                        values: vec![],
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert!(LifecycleStage::compile(&bad_expr).is_err());

        let bad_event = stage(
            "event",
            StageSpec {
                next: StageNext {
                    event: Some(StageEvent {
                        type_: Some("Info".into()),
                        reason: "Created".into(),
                        message: None,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert!(LifecycleStage::compile(&bad_event).is_err());
    }

    #[test]
    fn apply_produces_at_most_one_status_mutation() {
        let lc = Lifecycle::compile(&[phase_stage("running", "Pending", "phase: Running")]).unwrap();
        let pod = json!({"metadata": {"name": "p"}, "status": {"phase": "Pending"}});
        let chosen = lc
            .match_stage(&meta(&[]), &meta(&[]), &pod, &mut rng())
            .unwrap();
        let outcome = chosen.apply(&pod, &TemplateRenderer::new()).unwrap();

        assert_eq!(outcome.status_patch, Some(json!({"phase": "Running"})));
        assert!(!outcome.delete);
        assert!(outcome.event.is_none());
        assert!(outcome.finalizers.is_none());
    }

    #[test]
    fn converged_resource_no_longer_transitions() {
        // S1 shape: Pending -> Running, then the Running stage is a no-op.
        let lc = Lifecycle::compile(&[
            phase_stage("to-running", "Pending", "phase: Running"),
            stage(
                "steady",
                StageSpec {
                    selector: Some(StageSelector {
                        match_expressions: Some(vec![SelectorRequirement {
                            key: ".status.phase".into(),
                            operator: SelectorOperator::In,
                            values: vec!["Running".into()],
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
        ])
        .unwrap();
        let renderer = TemplateRenderer::new();

        let mut pod = json!({"metadata": {"name": "p"}, "status": {"phase": "Pending"}});
        let first = lc
            .match_stage(&meta(&[]), &meta(&[]), &pod, &mut rng())
            .unwrap();
        assert_eq!(first.name(), "to-running");
        let outcome = first.apply(&pod, &renderer).unwrap();
        let patch = outcome.status_patch.unwrap();
        merge_value(&mut pod["status"], &patch);
        assert_eq!(pod["status"]["phase"], "Running");

        // The steady stage wins now and asks for no mutation.
        let second = lc
            .match_stage(&meta(&[]), &meta(&[]), &pod, &mut rng())
            .unwrap();
        assert_eq!(second.name(), "steady");
        let outcome = second.apply(&pod, &renderer).unwrap();
        assert!(outcome.status_patch.is_none());
        assert!(!outcome.delete);
    }
}
