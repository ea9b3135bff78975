//! Node controller
//!
//! Watches Nodes, filters them down to the ones this process manages, and
//! drives each through the Node-kind stage lifecycle. The cache of
//! [`NodeInfo`] doubles as the lookup surface for the Pod and lease
//! controllers (node ownership, lease owner references, host IPs).
//!
//! Dispatches are serialised per node: while a stage task is pending for a
//! node, further events only refresh the cache. A node whose lease this
//! process does not hold stays read-only; its cache entry is maintained but
//! no patch is ever issued.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{meta_maps, object_reference, updated_finalizers, DisregardFilter, ReadOnlyFn};
use crate::cache::{NodeIndex, NodeInfo};
use crate::error::{is_conflict, is_not_found, Error};
use crate::events::EventPublisher;
use crate::executor::TaskGroup;
use crate::lifecycle::{LifecycleStage, TemplateRenderer};
use crate::resources::LifecycleGetter;

/// Client-side Node filter
pub type NodeSelectorFn = Box<dyn Fn(&Node) -> bool + Send + Sync>;
/// Callback fired the first time a Node is seen as manageable
pub type OnNodeManagedFn = Box<dyn Fn(String) + Send + Sync>;

/// Configuration for the Node controller
pub struct NodeControllerConfig {
    /// API client
    pub client: Client,
    /// Server-side label selector for the watch; empty watches everything
    pub manage_nodes_with_label_selector: String,
    /// Client-side filter (annotation selector or manage-all)
    pub node_selector_fn: NodeSelectorFn,
    /// Gate suppressing `.status` writes
    pub disregard: DisregardFilter,
    /// If non-empty, a Node the controller creates itself at startup
    pub node_name: String,
    /// IP advertised on a self-created Node
    pub node_ip: String,
    /// Kubelet port advertised on a self-created Node
    pub node_port: u16,
    /// Node-kind stage rules
    pub lifecycle: Arc<dyn LifecycleGetter>,
    /// Status template renderer
    pub renderer: Arc<TemplateRenderer>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// True for nodes whose lease this process does not hold
    pub read_only_fn: ReadOnlyFn,
    /// Executor group for Node stage tasks
    pub tasks: TaskGroup,
    /// RNG seed for stage tiebreaks; tests pin it
    pub rng_seed: Option<u64>,
}

/// Watches and mutates the Nodes this process manages
pub struct NodeController {
    api: Api<Node>,
    label_selector: String,
    node_selector_fn: NodeSelectorFn,
    disregard: DisregardFilter,
    node_name: String,
    node_ip: String,
    node_port: u16,
    cache: NodeIndex,
    managed: dashmap::DashMap<String, ()>,
    inflight: dashmap::DashMap<String, ()>,
    lifecycle: Arc<dyn LifecycleGetter>,
    renderer: Arc<TemplateRenderer>,
    events: Arc<dyn EventPublisher>,
    read_only_fn: ReadOnlyFn,
    on_node_managed_fn: OnceLock<OnNodeManagedFn>,
    tasks: TaskGroup,
    rng: Mutex<StdRng>,
    cancel: CancellationToken,
}

impl NodeController {
    /// Create the controller; `set_on_node_managed_fn` must be wired before
    /// `start`.
    pub fn new(config: NodeControllerConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            api: Api::all(config.client),
            label_selector: config.manage_nodes_with_label_selector,
            node_selector_fn: config.node_selector_fn,
            disregard: config.disregard,
            node_name: config.node_name,
            node_ip: config.node_ip,
            node_port: config.node_port,
            cache: NodeIndex::new(),
            managed: dashmap::DashMap::new(),
            inflight: dashmap::DashMap::new(),
            lifecycle: config.lifecycle,
            renderer: config.renderer,
            events: config.events,
            read_only_fn: config.read_only_fn,
            on_node_managed_fn: OnceLock::new(),
            tasks: config.tasks,
            rng: Mutex::new(match config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            cancel,
        })
    }

    /// Wire the first-manage callback (lease acquisition or pod replay)
    pub fn set_on_node_managed_fn(&self, f: OnNodeManagedFn) {
        let _ = self.on_node_managed_fn.set(f);
    }

    /// Cached info for a node, if known
    pub fn get(&self, name: &str) -> Option<Arc<NodeInfo>> {
        self.cache.get(name)
    }

    /// Snapshot of all cached nodes
    pub fn list(&self) -> Vec<Arc<NodeInfo>> {
        self.cache.list()
    }

    /// True if the node has passed the manage filters at least once
    pub fn is_managed(&self, name: &str) -> bool {
        self.managed.contains_key(name)
    }

    /// Start the watch loop (and create the configured node if missing)
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if !self.node_name.is_empty() {
            self.ensure_node_exists().await?;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch_loop().await });
        Ok(())
    }

    /// Re-fetch and dispatch every cached, writable node.
    ///
    /// Fired when the stage rules change so nodes converge against the new
    /// rules without waiting for their next watch event.
    pub fn replay_all(self: &Arc<Self>) {
        for info in self.cache.list() {
            if self.managed.contains_key(&info.name) && !(self.read_only_fn)(&info.name) {
                self.manage(&info.name);
            }
        }
    }

    /// Re-fetch and dispatch a node; the lease controller calls this after
    /// an acquire so the node catches up without waiting for a watch event.
    pub fn manage(self: &Arc<Self>, name: &str) {
        self.managed.insert(name.to_string(), ());
        let this = Arc::clone(self);
        let name = name.to_string();
        self.tasks.submit(None, async move {
            match this.api.get(&name).await {
                Ok(node) => this.handle_node(node),
                Err(err) if is_not_found(&err) => {
                    this.cache.remove(&name);
                }
                Err(err) => {
                    warn!(node = %name, error = %err, "failed to fetch node for manage");
                }
            }
        });
    }

    async fn ensure_node_exists(&self) -> Result<(), Error> {
        match self.api.get(&self.node_name).await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
        let node = self.initial_node();
        match self.api.create(&PostParams::default(), &node).await {
            Ok(_) => {
                info!(node = %self.node_name, "created node");
                Ok(())
            }
            Err(err) if is_conflict(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Minimal Node object for self-hosting scenarios; stages fill in the
    /// rest of the status.
    fn initial_node(&self) -> Node {
        let mut node = Node {
            metadata: ObjectMeta {
                name: Some(self.node_name.clone()),
                labels: Some(
                    [
                        ("kubernetes.io/hostname".to_string(), self.node_name.clone()),
                        ("type".to_string(), "kwok".to_string()),
                    ]
                    .into(),
                ),
                annotations: Some(
                    [("kwok.x-k8s.io/node".to_string(), "fake".to_string())].into(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let status = node.status.get_or_insert_with(Default::default);
        status.addresses = Some(vec![k8s_openapi::api::core::v1::NodeAddress {
            type_: "InternalIP".to_string(),
            address: self.node_ip.clone(),
        }]);
        status.daemon_endpoints = Some(k8s_openapi::api::core::v1::NodeDaemonEndpoints {
            kubelet_endpoint: Some(k8s_openapi::api::core::v1::DaemonEndpoint {
                port: i32::from(self.node_port),
            }),
        });
        node
    }

    async fn watch_loop(self: Arc<Self>) {
        let mut config = watcher::Config::default().any_semantic();
        if !self.label_selector.is_empty() {
            config = config.labels(&self.label_selector);
        }
        let stream = watcher(self.api.clone(), config).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("node watcher stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(Event::Apply(node) | Event::InitApply(node))) => {
                        self.handle_node(node);
                    }
                    Some(Ok(Event::Delete(node))) => {
                        let name = node.name_any();
                        debug!(node = %name, "node deleted");
                        self.cache.remove(&name);
                        self.managed.remove(&name);
                    }
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "node watch error, backing off");
                    }
                    None => {
                        error!("node watch stream ended unexpectedly");
                        return;
                    }
                }
            }
        }
    }

    fn handle_node(self: &Arc<Self>, node: Node) {
        if !(self.node_selector_fn)(&node) {
            return;
        }
        let name = node.name_any();
        self.cache.put(node_info(&node));

        if self.managed.insert(name.clone(), ()).is_none() {
            if let Some(on_managed) = self.on_node_managed_fn.get() {
                on_managed(name.clone());
            }
        }
        // Not holding the lease: keep the cache fresh, never patch.
        if (self.read_only_fn)(&name) {
            return;
        }
        self.dispatch(node);
    }

    fn dispatch(self: &Arc<Self>, node: Node) {
        let name = node.name_any();
        if self.inflight.insert(name.clone(), ()).is_some() {
            // A stage application is already pending for this node; the
            // next watch event re-triggers.
            return;
        }

        let data = match serde_json::to_value(&node) {
            Ok(data) => data,
            Err(err) => {
                error!(node = %name, error = %err, "failed to serialize node");
                self.inflight.remove(&name);
                return;
            }
        };
        let (labels, annotations) = meta_maps(&node.metadata);
        let lifecycle = self.lifecycle.get();
        let (stage, delay) = {
            let mut rng = self.rng.lock();
            let Some(stage) = lifecycle.match_stage(&labels, &annotations, &data, &mut *rng)
            else {
                self.inflight.remove(&name);
                return;
            };
            let delay = stage.delay(&data, Utc::now(), &mut *rng);
            (stage, delay)
        };

        debug!(node = %name, stage = %stage.name(), delay = ?delay, "dispatching node stage");
        let this = Arc::clone(self);
        self.tasks.submit(delay, async move {
            let result =
                tokio::time::timeout(super::APPLY_TIMEOUT, this.play_stage(&node, &stage)).await;
            this.inflight.remove(&name);
            match result {
                Ok(Ok(Some(next))) if stage.immediate_next_stage() => this.dispatch(next),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(node = %name, stage = %stage.name(), error = %err, "node stage failed");
                }
                Err(_) => {
                    warn!(node = %name, stage = %stage.name(), "node stage timed out");
                }
            }
        });
    }

    async fn play_stage(&self, node: &Node, stage: &LifecycleStage) -> Result<Option<Node>, Error> {
        let name = node.name_any();
        let data = serde_json::to_value(node).map_err(|e| Error::serialization(e.to_string()))?;
        let outcome = stage.apply(&data, &self.renderer)?;

        if let Some(event) = &outcome.event {
            self.events
                .publish(&object_reference("Node", &node.metadata), event)
                .await;
        }

        if let Some(change) = &outcome.finalizers {
            if let Some(finalizers) = updated_finalizers(&node.metadata, change) {
                let patch = json!({"metadata": {"finalizers": finalizers}});
                match self
                    .api
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => {}
                    Err(err) if is_not_found(&err) => {
                        self.cache.remove(&name);
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if outcome.delete {
            match self
                .api
                .delete(&name, &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => {
                    info!(node = %name, stage = %outcome.stage_name, "node deleted by stage");
                }
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(None);
        }

        let Some(patch) = outcome.status_patch else {
            debug!(node = %name, stage = %outcome.stage_name, result = "no-op", "node stage applied");
            return Ok(Some(node.clone()));
        };
        let (labels, annotations) = meta_maps(&node.metadata);
        if self.disregard.matches(&labels, &annotations) {
            debug!(node = %name, stage = %outcome.stage_name, "status write disregarded");
            return Ok(None);
        }

        let patched = crate::retry::retry_transient(
            &crate::retry::RetryConfig::default(),
            "node status patch",
            || self.patch_status(&name, &patch),
        )
        .await;
        match patched {
            Ok(updated) => {
                debug!(node = %name, stage = %outcome.stage_name, result = "applied", "node stage applied");
                Ok(Some(updated))
            }
            Err(Error::Kube(err)) if is_conflict(&err) => {
                // Re-read and recompute once; conflicts past that drop the
                // cycle and the next watch event re-triggers.
                let fresh = match self.api.get(&name).await {
                    Ok(fresh) => fresh,
                    Err(err) if is_not_found(&err) => {
                        self.cache.remove(&name);
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };
                let data =
                    serde_json::to_value(&fresh).map_err(|e| Error::serialization(e.to_string()))?;
                let outcome = stage.apply(&data, &self.renderer)?;
                match outcome.status_patch {
                    Some(patch) => Ok(Some(self.patch_status(&name, &patch).await?)),
                    None => Ok(Some(fresh)),
                }
            }
            Err(Error::Kube(err)) if is_not_found(&err) => {
                self.cache.remove(&name);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn patch_status(&self, name: &str, patch: &serde_json::Value) -> Result<Node, Error> {
        let body = json!({"status": patch});
        Ok(self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }
}

/// Project a Node into its cached form.
///
/// The started-container counter starts at zero here; the cache preserves
/// the live tally across replacements and the Pod controller advances it
/// as pods on the node start their containers.
fn node_info(node: &Node) -> NodeInfo {
    let host_ips = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default();
    let owner_references = match (&node.metadata.name, &node.metadata.uid) {
        (Some(name), Some(uid)) => vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "v1".to_string(),
                kind: "Node".to_string(),
                name: name.clone(),
                uid: uid.clone(),
                ..Default::default()
            },
        ],
        _ => Vec::new(),
    };
    NodeInfo {
        name: node.name_any(),
        owner_references,
        host_ips,
        started_containers: Arc::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    fn node(name: &str, uid: &str, internal_ip: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            status: internal_ip.map(|ip| NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: ip.to_string(),
                    },
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: name.to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_info_projects_internal_ips_only() {
        let info = node_info(&node("n0", "uid-0", Some("10.1.0.1")));
        assert_eq!(info.name, "n0");
        assert_eq!(info.host_ips, vec!["10.1.0.1"]);
        // A fresh projection has started no containers yet.
        assert_eq!(
            info.started_containers
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn node_info_owner_reference_points_at_the_node() {
        let info = node_info(&node("n0", "uid-0", None));
        assert_eq!(info.owner_references.len(), 1);
        let owner = &info.owner_references[0];
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.name, "n0");
        assert_eq!(owner.uid, "uid-0");
        assert!(info.host_ips.is_empty());
    }

    #[test]
    fn node_without_uid_gets_no_owner_reference() {
        let mut n = node("n0", "uid-0", None);
        n.metadata.uid = None;
        assert!(node_info(&n).owner_references.is_empty());
    }
}
