//! Controller wiring
//!
//! Builds the lease, Node, and Pod controllers against one API server and
//! closes the callback cycle between them: a Node passing the manage
//! filters triggers lease acquisition, a successful acquire triggers
//! `manage` on the Node controller and a pod replay on the Pod controller,
//! and the lease carries owner references read out of the Node cache.
//! Callbacks are function values wired after construction, so no component
//! holds a direct reference to another.

mod lease;
mod node;
mod pod;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::ObjectMeta;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use lease::{
    holders_of, lease_expired, lease_held_by, NodeLeaseController, NodeLeaseControllerConfig,
    HOLDERS_ANNOTATION, LEASE_NAMESPACE,
};
pub use node::{NodeController, NodeControllerConfig, NodeSelectorFn};
pub use pod::{NodeGetFn, PodController, PodControllerConfig};

use crate::config::Options;
use crate::crd::{Stage, StageFinalizers};
use crate::error::Error;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::executor::{
    Executor, TaskGroup, NODE_DELAY_PRIORITY, NODE_LEASE_PRIORITY, NODE_PRIORITY,
    POD_DELAY_PRIORITY, POD_PRIORITY,
};
use crate::lifecycle::{Lifecycle, TemplateRenderer};
use crate::resources::{LifecycleGetter, StageStore, StageWatcher, StaticGetter};
use crate::selector::Selector;

/// Per-node read-only check, shared between the Node and Pod controllers
pub type ReadOnlyFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Budget for the API calls of one stage application; the stage's delay has
/// already elapsed by the time this clock starts.
pub(crate) const APPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Gate suppressing `.status` writes on matching resources.
///
/// Matching resources still get deletions and finalizer changes; only
/// their status is preserved.
#[derive(Clone, Debug, Default)]
pub struct DisregardFilter {
    label: Selector,
    annotation: Selector,
}

impl DisregardFilter {
    /// Parse the pair of disregard selectors
    pub fn parse(label_selector: &str, annotation_selector: &str) -> Result<Self, Error> {
        Ok(Self {
            label: Selector::parse(label_selector)?,
            annotation: Selector::parse(annotation_selector)?,
        })
    }

    /// True if status writes must be suppressed for this metadata
    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        (!self.label.is_empty() && self.label.matches(labels))
            || (!self.annotation.is_empty() && self.annotation.matches(annotations))
    }
}

/// Labels and annotations of an object, defaulting to empty maps
pub(crate) fn meta_maps(
    meta: &ObjectMeta,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    (
        meta.labels.clone().unwrap_or_default(),
        meta.annotations.clone().unwrap_or_default(),
    )
}

/// Reference to a core/v1 object for event recording
pub(crate) fn object_reference(kind: &str, meta: &ObjectMeta) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some(kind.to_string()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        ..Default::default()
    }
}

/// The finalizer list after applying a stage's change, or `None` when the
/// change makes no difference (skip the patch).
pub(crate) fn updated_finalizers(
    meta: &ObjectMeta,
    change: &StageFinalizers,
) -> Option<Vec<String>> {
    let current = meta.finalizers.clone().unwrap_or_default();
    if change.empty {
        return (!current.is_empty()).then(Vec::new);
    }
    let mut updated: Vec<String> = current
        .iter()
        .filter(|f| !change.remove.contains(f))
        .cloned()
        .collect();
    for addition in &change.add {
        if !updated.contains(addition) {
            updated.push(addition.clone());
        }
    }
    (updated != current).then_some(updated)
}

/// A unique identity for this process: `<hostname>_<uuid>`.
///
/// The uniquifier keeps two processes on the same host from both becoming
/// active holders of a lease.
pub fn identity() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "kwok".to_string());
    format!("{}_{}", hostname, Uuid::new_v4())
}

/// Configuration for the assembled controller
pub struct ControllerConfig {
    /// API client
    pub client: Client,
    /// Resolved options
    pub options: Options,
    /// Statically configured stages; empty switches to dynamic loading
    pub stages: Vec<Stage>,
    /// Process identity used as the lease holder
    pub id: String,
}

/// The assembled simulation controller
pub struct Controller {
    nodes: Arc<NodeController>,
    pods: Arc<PodController>,
    leases: Option<Arc<NodeLeaseController>>,
}

impl Controller {
    /// Build and start every component.
    ///
    /// Components stop when `cancel` fires; call [`Controller::shutdown`]
    /// afterwards to release held leases.
    pub async fn start(config: ControllerConfig, cancel: CancellationToken) -> Result<Self, Error> {
        let ControllerConfig {
            client,
            options,
            stages,
            id,
        } = config;

        let executor = Executor::start(options.total_parallel, cancel.clone());
        let renderer = Arc::new(TemplateRenderer::new());
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client.clone(), id.clone()));

        let (node_lifecycle, pod_lifecycle, stage_store) =
            Self::stage_getters(&client, &options, stages, &cancel)?;

        // Client-side manage filter: manage-all admits everything, an
        // annotation selector is evaluated locally, a label selector is
        // already applied server-side by the watch.
        let node_selector_fn: NodeSelectorFn = if options.manage_all_nodes {
            Box::new(|_| true)
        } else if !options.manage_nodes_with_annotation_selector.is_empty() {
            let selector = Selector::parse(&options.manage_nodes_with_annotation_selector)?;
            Box::new(move |node| {
                let annotations = node.metadata.annotations.clone().unwrap_or_default();
                selector.matches(&annotations)
            })
        } else {
            Box::new(|_| true)
        };

        let disregard = DisregardFilter::parse(
            &options.disregard_status_with_label_selector,
            &options.disregard_status_with_annotation_selector,
        )?;

        // Zero lease duration disables leasing entirely: every managed
        // node is writable immediately.
        let leases = (options.node_lease_duration_seconds > 0).then(|| {
            NodeLeaseController::new(
                NodeLeaseControllerConfig {
                    client: client.clone(),
                    holder_identity: id.clone(),
                    lease_duration_seconds: options.node_lease_duration_seconds,
                    shareable: options.enable_node_lease_shareable,
                    tasks: TaskGroup::new(
                        Arc::clone(&executor),
                        options.node_lease_parallelism,
                        NODE_LEASE_PRIORITY,
                        NODE_LEASE_PRIORITY,
                    ),
                    rng_seed: None,
                },
                cancel.clone(),
            )
        });

        let read_only_fn: ReadOnlyFn = match &leases {
            Some(leases) => {
                let leases = Arc::clone(leases);
                Arc::new(move |name| !leases.held(name))
            }
            None => Arc::new(|_| false),
        };

        let nodes = NodeController::new(
            NodeControllerConfig {
                client: client.clone(),
                manage_nodes_with_label_selector: options.manage_nodes_with_label_selector.clone(),
                node_selector_fn,
                disregard: disregard.clone(),
                node_name: options.node_name.clone(),
                node_ip: options.node_ip.clone(),
                node_port: options.node_port,
                lifecycle: node_lifecycle,
                renderer: Arc::clone(&renderer),
                events: Arc::clone(&events),
                read_only_fn: Arc::clone(&read_only_fn),
                tasks: TaskGroup::new(
                    Arc::clone(&executor),
                    options.node_play_stage_parallelism,
                    NODE_PRIORITY,
                    NODE_DELAY_PRIORITY,
                ),
                rng_seed: None,
            },
            cancel.clone(),
        );

        let node_get_fn: NodeGetFn = {
            let nodes = Arc::clone(&nodes);
            Arc::new(move |name| nodes.get(name))
        };
        let pods = PodController::new(
            PodControllerConfig {
                client: client.clone(),
                cidr: options.cidr.clone(),
                node_ip: options.node_ip.clone(),
                enable_cni: options.enable_cni,
                disregard,
                lifecycle: pod_lifecycle,
                renderer,
                events,
                node_get_fn,
                read_only_fn,
                tasks: TaskGroup::new(
                    Arc::clone(&executor),
                    options.pod_play_stage_parallelism,
                    POD_PRIORITY,
                    POD_DELAY_PRIORITY,
                ),
                rng_seed: None,
            },
            cancel.clone(),
        );

        // Close the cycle with function values, mirroring the ownership
        // rules: with leasing, a manageable node first acquires its lease
        // and the acquire replays its pods; without leasing, the replay is
        // immediate.
        match &leases {
            Some(leases) => {
                {
                    let leases = Arc::clone(leases);
                    nodes.set_on_node_managed_fn(Box::new(move |name| {
                        leases.try_hold(&name);
                    }));
                }
                {
                    let nodes = Arc::clone(&nodes);
                    let pods = Arc::clone(&pods);
                    leases.set_on_node_managed_fn(Box::new(move |name| {
                        nodes.manage(&name);
                        pods.play_stage_pods_on_node(&name);
                    }));
                }
                {
                    let nodes = Arc::clone(&nodes);
                    leases.set_owner_refs_fn(Box::new(move |name| {
                        nodes
                            .get(name)
                            .map(|info| info.owner_references.clone())
                            .unwrap_or_default()
                    }));
                }
            }
            None => {
                let pods = Arc::clone(&pods);
                nodes.set_on_node_managed_fn(Box::new(move |name| {
                    pods.play_stage_pods_on_node(&name);
                }));
            }
        }

        // A live rule change replays everything already cached, so resources
        // converge against the new rules without waiting for watch events.
        if let Some(store) = &stage_store {
            let nodes = Arc::clone(&nodes);
            let pods = Arc::clone(&pods);
            store.set_on_changed(Box::new(move || {
                nodes.replay_all();
                pods.replay_all();
            }));
        }

        pods.start();
        nodes.start().await?;
        info!(id = %id, leasing = leases.is_some(), "controller started");

        Ok(Self {
            nodes,
            pods,
            leases,
        })
    }

    /// Build the per-kind lifecycle getters: static compilation when stages
    /// are configured, the Stage CRD watcher otherwise (or when the Stage
    /// CRD is explicitly enabled).
    #[allow(clippy::type_complexity)]
    fn stage_getters(
        client: &Client,
        options: &Options,
        stages: Vec<Stage>,
        cancel: &CancellationToken,
    ) -> Result<
        (
            Arc<dyn LifecycleGetter>,
            Arc<dyn LifecycleGetter>,
            Option<Arc<StageStore>>,
        ),
        Error,
    > {
        if stages.is_empty() || options.stage_crd_enabled() {
            let store = Arc::new(StageStore::new());
            let node = store.node_lifecycle();
            let pod = store.pod_lifecycle();
            let watcher = StageWatcher::new(client.clone(), Arc::clone(&store));
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.run(cancel).await });
            info!("watching Stage resources for lifecycle rules");
            return Ok((node, pod, Some(store)));
        }

        let (node_stages, pod_stages): (Vec<Stage>, Vec<Stage>) = stages
            .into_iter()
            .partition(|s| s.spec.resource_ref.kind == "Node");
        let pod_stages: Vec<Stage> = pod_stages
            .into_iter()
            .filter(|s| s.spec.resource_ref.kind == "Pod")
            .collect();
        info!(
            node_stages = node_stages.len(),
            pod_stages = pod_stages.len(),
            "using statically configured stages"
        );
        Ok((
            Arc::new(StaticGetter::new(Lifecycle::compile(&node_stages)?)),
            Arc::new(StaticGetter::new(Lifecycle::compile(&pod_stages)?)),
            None,
        ))
    }

    /// Cached info for a node
    pub fn get_node(&self, name: &str) -> Option<Arc<crate::cache::NodeInfo>> {
        self.nodes.get(name)
    }

    /// All cached nodes
    pub fn list_nodes(&self) -> Vec<Arc<crate::cache::NodeInfo>> {
        self.nodes.list()
    }

    /// All cached pods on a node
    pub fn list_pods(&self, node_name: &str) -> Vec<Arc<crate::cache::PodInfo>> {
        self.pods.list(node_name)
    }

    /// Release held leases, best-effort; called after cancellation
    pub async fn shutdown(&self) {
        if let Some(leases) = &self.leases {
            leases.release_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        finalizers: &[&str],
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some("x".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            finalizers: (!finalizers.is_empty())
                .then(|| finalizers.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn disregard_matches_either_selector() {
        let filter = DisregardFilter::parse(
            "kwok.x-k8s.io/preserve=true",
            "example.com/keep=yes",
        )
        .unwrap();

        let (labels, annotations) =
            meta_maps(&meta(&[("kwok.x-k8s.io/preserve", "true")], &[], &[]));
        assert!(filter.matches(&labels, &annotations));

        let (labels, annotations) = meta_maps(&meta(&[], &[("example.com/keep", "yes")], &[]));
        assert!(filter.matches(&labels, &annotations));

        let (labels, annotations) =
            meta_maps(&meta(&[("kwok.x-k8s.io/preserve", "false")], &[], &[]));
        assert!(!filter.matches(&labels, &annotations));
    }

    #[test]
    fn empty_disregard_never_matches() {
        let filter = DisregardFilter::parse("", "").unwrap();
        let (labels, annotations) = meta_maps(&meta(&[("any", "thing")], &[], &[]));
        assert!(!filter.matches(&labels, &annotations));
    }

    #[test]
    fn finalizer_empty_strips_everything() {
        let m = meta(&[], &[], &["kwok.x-k8s.io/fake", "other"]);
        let change = StageFinalizers {
            empty: true,
            ..Default::default()
        };
        assert_eq!(updated_finalizers(&m, &change), Some(vec![]));

        // Already empty: nothing to patch.
        let m = meta(&[], &[], &[]);
        assert_eq!(updated_finalizers(&m, &change), None);
    }

    #[test]
    fn finalizer_add_and_remove_deduplicate() {
        let m = meta(&[], &[], &["a", "b"]);
        let change = StageFinalizers {
            add: vec!["c".into(), "a".into()],
            remove: vec!["b".into()],
            empty: false,
        };
        assert_eq!(
            updated_finalizers(&m, &change),
            Some(vec!["a".to_string(), "c".to_string()])
        );

        // A change that lands on the current state patches nothing.
        let m = meta(&[], &[], &["a", "c"]);
        assert_eq!(updated_finalizers(&m, &change), None);
    }

    #[test]
    fn object_reference_carries_identity() {
        let m = ObjectMeta {
            name: Some("p0".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        };
        let r = object_reference("Pod", &m);
        assert_eq!(r.kind.as_deref(), Some("Pod"));
        assert_eq!(r.name.as_deref(), Some("p0"));
        assert_eq!(r.namespace.as_deref(), Some("default"));
        assert_eq!(r.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn identity_is_unique_per_call() {
        let a = identity();
        let b = identity();
        assert_ne!(a, b);
        assert!(a.contains('_'));
    }
}
