//! Pod controller
//!
//! Mirrors the Node controller for Pods: watches every namespace, caches
//! pods partitioned by node, and drives the ones scheduled onto managed,
//! non-read-only nodes through the Pod-kind stage lifecycle.
//!
//! Pod IPs: with CNI integration disabled (the default), each node gets an
//! address pool over the configured CIDR; a pod's IP is injected into its
//! first status write and returned to the pool when the pod goes away.
//! Host-network pods take the node IP instead. After a restart the pools
//! are re-derived from the IPs already visible on pod statuses.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
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
use crate::cache::{NodeInfo, PodIndex, PodInfo};
use crate::error::{is_conflict, is_not_found, Error};
use crate::events::EventPublisher;
use crate::executor::TaskGroup;
use crate::ipam::IpPool;
use crate::lifecycle::{LifecycleStage, TemplateRenderer};
use crate::resources::LifecycleGetter;

/// Node cache lookup injected by the wiring; `None` means unmanaged
pub type NodeGetFn = Arc<dyn Fn(&str) -> Option<Arc<NodeInfo>> + Send + Sync>;

/// Configuration for the Pod controller
pub struct PodControllerConfig {
    /// API client
    pub client: Client,
    /// CIDR each node's IP pool draws from
    pub cidr: String,
    /// Fallback node IP for host-network pods
    pub node_ip: String,
    /// Leave IPs to the host network stack
    pub enable_cni: bool,
    /// Gate suppressing `.status` writes
    pub disregard: DisregardFilter,
    /// Pod-kind stage rules
    pub lifecycle: Arc<dyn LifecycleGetter>,
    /// Status template renderer
    pub renderer: Arc<TemplateRenderer>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Node cache lookup
    pub node_get_fn: NodeGetFn,
    /// True for nodes whose lease this process does not hold
    pub read_only_fn: ReadOnlyFn,
    /// Executor group for Pod stage tasks
    pub tasks: TaskGroup,
    /// RNG seed for stage tiebreaks; tests pin it
    pub rng_seed: Option<u64>,
}

/// Watches and mutates Pods on managed nodes
pub struct PodController {
    client: Client,
    cidr: String,
    node_ip: String,
    enable_cni: bool,
    disregard: DisregardFilter,
    cache: PodIndex,
    pools: DashMap<String, Arc<IpPool>>,
    inflight: DashMap<String, ()>,
    started: DashMap<String, ()>,
    lifecycle: Arc<dyn LifecycleGetter>,
    renderer: Arc<TemplateRenderer>,
    events: Arc<dyn EventPublisher>,
    node_get_fn: NodeGetFn,
    read_only_fn: ReadOnlyFn,
    tasks: TaskGroup,
    rng: Mutex<StdRng>,
    cancel: CancellationToken,
}

impl PodController {
    /// Create the controller
    pub fn new(config: PodControllerConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            client: config.client,
            cidr: config.cidr,
            node_ip: config.node_ip,
            enable_cni: config.enable_cni,
            disregard: config.disregard,
            cache: PodIndex::new(),
            pools: DashMap::new(),
            inflight: DashMap::new(),
            started: DashMap::new(),
            lifecycle: config.lifecycle,
            renderer: config.renderer,
            events: config.events,
            node_get_fn: config.node_get_fn,
            read_only_fn: config.read_only_fn,
            tasks: config.tasks,
            rng: Mutex::new(match config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            cancel,
        })
    }

    /// Pods currently cached for a node
    pub fn list(&self, node_name: &str) -> Vec<Arc<PodInfo>> {
        self.cache.list_on_node(node_name)
    }

    /// Start the watch loop over all namespaces
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch_loop().await });
    }

    /// Replay every cached pod on a node through the lifecycle.
    ///
    /// The lease controller calls this after acquiring a node so pods that
    /// arrived while the node was unmanaged catch up.
    pub fn play_stage_pods_on_node(self: &Arc<Self>, node_name: &str) {
        let pods = self.cache.list_on_node(node_name);
        debug!(node = node_name, pods = pods.len(), "replaying pods on node");
        for info in pods {
            self.dispatch(info.pod.clone());
        }
    }

    /// Replay the pods of every managed, writable node.
    ///
    /// Fired when the stage rules change so running pods converge against
    /// the new rules without waiting for their next watch event.
    pub fn replay_all(self: &Arc<Self>) {
        for node_name in self.cache.node_names() {
            if (self.node_get_fn)(&node_name).is_some() && !(self.read_only_fn)(&node_name) {
                self.play_stage_pods_on_node(&node_name);
            }
        }
    }

    async fn watch_loop(self: Arc<Self>) {
        let api: Api<Pod> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("pod watcher stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(Event::Apply(pod) | Event::InitApply(pod))) => {
                        self.handle_pod(pod);
                    }
                    Some(Ok(Event::Delete(pod))) => {
                        self.handle_pod_deleted(&pod);
                    }
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "pod watch error, backing off");
                    }
                    None => {
                        error!("pod watch stream ended unexpectedly");
                        return;
                    }
                }
            }
        }
    }

    fn handle_pod(self: &Arc<Self>, pod: Pod) {
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            // Unscheduled pods are the scheduler's business.
            return;
        };

        // Keep the cache and IP pool coherent even for unmanaged nodes so a
        // later lease acquire can replay and allocation stays collision-free.
        if let Some(ip) = pod_ip_of(&pod) {
            if let Some(pool) = self.pool_for(&node_name) {
                pool.mark_used(ip);
            }
        }
        self.cache.put(PodInfo {
            uid: pod.uid().unwrap_or_default(),
            node_name: node_name.clone(),
            pod: pod.clone(),
        });

        // A pod is owned by this controller iff its node is managed and the
        // node's lease (if any) is locally held.
        if (self.node_get_fn)(&node_name).is_none() {
            return;
        }
        if (self.read_only_fn)(&node_name) {
            return;
        }
        self.dispatch(pod);
    }

    fn handle_pod_deleted(&self, pod: &Pod) {
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return;
        };
        let uid = pod.uid().unwrap_or_default();
        debug!(pod = %pod.name_any(), node = node_name, "pod deleted");
        self.cache.remove(node_name, &uid);
        self.started.remove(&dispatch_key(pod));
        if let (Some(ip), Some(pool)) = (pod_ip_of(pod), self.pool_for(node_name)) {
            pool.release(ip);
        }
    }

    /// Advance the node's started-container tally the first time this pod's
    /// status is written. A recreated pod counts again.
    fn record_started_containers(&self, pod: &Pod) {
        if self.started.insert(dispatch_key(pod), ()).is_some() {
            return;
        }
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return;
        };
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.len() as u64)
            .unwrap_or(0);
        if containers == 0 {
            return;
        }
        if let Some(info) = (self.node_get_fn)(node_name) {
            info.started_containers.fetch_add(containers, Ordering::Relaxed);
        }
    }

    fn dispatch(self: &Arc<Self>, pod: Pod) {
        let key = dispatch_key(&pod);
        if self.inflight.insert(key.clone(), ()).is_some() {
            return;
        }

        let data = match serde_json::to_value(&pod) {
            Ok(data) => data,
            Err(err) => {
                error!(pod = %key, error = %err, "failed to serialize pod");
                self.inflight.remove(&key);
                return;
            }
        };
        let (labels, annotations) = meta_maps(&pod.metadata);
        let lifecycle = self.lifecycle.get();
        let (stage, delay) = {
            let mut rng = self.rng.lock();
            let Some(stage) = lifecycle.match_stage(&labels, &annotations, &data, &mut *rng)
            else {
                self.inflight.remove(&key);
                return;
            };
            let delay = stage.delay(&data, Utc::now(), &mut *rng);
            (stage, delay)
        };

        debug!(pod = %key, stage = %stage.name(), delay = ?delay, "dispatching pod stage");
        let this = Arc::clone(self);
        self.tasks.submit(delay, async move {
            let result =
                tokio::time::timeout(super::APPLY_TIMEOUT, this.play_stage(&pod, &stage)).await;
            this.inflight.remove(&key);
            match result {
                Ok(Ok(Some(next))) if stage.immediate_next_stage() => this.dispatch(next),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(pod = %key, stage = %stage.name(), error = %err, "pod stage failed");
                }
                Err(_) => {
                    warn!(pod = %key, stage = %stage.name(), "pod stage timed out");
                }
            }
        });
    }

    async fn play_stage(&self, pod: &Pod, stage: &LifecycleStage) -> Result<Option<Pod>, Error> {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let data = serde_json::to_value(pod).map_err(|e| Error::serialization(e.to_string()))?;
        let mut outcome = stage.apply(&data, &self.renderer)?;

        if let Some(event) = &outcome.event {
            self.events
                .publish(&object_reference("Pod", &pod.metadata), event)
                .await;
        }

        // Finalizer changes go first so a deletion already in progress can
        // complete once the stage strips the blocking finalizer.
        if let Some(change) = &outcome.finalizers {
            if let Some(finalizers) = updated_finalizers(&pod.metadata, change) {
                let patch = json!({"metadata": {"finalizers": finalizers}});
                match api
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => {}
                    Err(err) if is_not_found(&err) => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if outcome.delete {
            match api
                .delete(&name, &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => {
                    info!(pod = %name, namespace = %namespace, stage = %outcome.stage_name,
                        "pod deleted by stage");
                }
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(None);
        }

        let Some(patch) = outcome.status_patch.take() else {
            debug!(pod = %name, stage = %outcome.stage_name, result = "no-op", "pod stage applied");
            return Ok(Some(pod.clone()));
        };
        let (labels, annotations) = meta_maps(&pod.metadata);
        if self.disregard.matches(&labels, &annotations) {
            debug!(pod = %name, stage = %outcome.stage_name, "status write disregarded");
            return Ok(None);
        }

        let (patch, allocated) = self.assign_pod_ip(pod, patch);
        let body = json!({"status": patch});
        let patched = crate::retry::retry_transient(
            &crate::retry::RetryConfig::default(),
            "pod status patch",
            || async {
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
                    .await
                    .map_err(Error::from)
            },
        )
        .await;
        match patched {
            Ok(updated) => {
                debug!(pod = %name, stage = %outcome.stage_name, result = "applied", "pod stage applied");
                self.record_started_containers(pod);
                Ok(Some(updated))
            }
            Err(Error::Kube(err)) if is_conflict(&err) => {
                if let Some(ip) = allocated {
                    self.release_ip(pod, ip);
                }
                // Re-read and recompute once.
                let fresh = match api.get(&name).await {
                    Ok(fresh) => fresh,
                    Err(err) if is_not_found(&err) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let data = serde_json::to_value(&fresh)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                let outcome = stage.apply(&data, &self.renderer)?;
                match outcome.status_patch {
                    Some(patch) => {
                        let (patch, _) = self.assign_pod_ip(&fresh, patch);
                        let body = json!({"status": patch});
                        let updated = api
                            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
                            .await?;
                        self.record_started_containers(&fresh);
                        Ok(Some(updated))
                    }
                    None => Ok(Some(fresh)),
                }
            }
            Err(Error::Kube(err)) if is_not_found(&err) => {
                // The pod vanished between dispatch and patch; return its IP.
                if let Some(ip) = allocated {
                    self.release_ip(pod, ip);
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Inject a pod IP into a status patch when neither the pod nor the
    /// patch carries one. Returns the patch and any freshly allocated IP so
    /// failed writes can return it to the pool.
    fn assign_pod_ip(
        &self,
        pod: &Pod,
        mut patch: serde_json::Value,
    ) -> (serde_json::Value, Option<Ipv4Addr>) {
        if self.enable_cni {
            return (patch, None);
        }
        if pod_ip_of(pod).is_some() || patch.get("podIP").is_some() {
            return (patch, None);
        }
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return (patch, None);
        };

        let host_ip = (self.node_get_fn)(node_name)
            .and_then(|info| info.host_ips.first().cloned())
            .unwrap_or_else(|| self.node_ip.clone());

        let host_network = pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);
        let (pod_ip, allocated) = if host_network {
            (host_ip.clone(), None)
        } else {
            match self.pool_for(node_name).map(|pool| pool.allocate()) {
                Some(Ok(ip)) => (ip.to_string(), Some(ip)),
                Some(Err(err)) => {
                    warn!(node = node_name, error = %err, "pod ip allocation failed");
                    return (patch, None);
                }
                None => return (patch, None),
            }
        };

        if let Some(map) = patch.as_object_mut() {
            map.insert("podIP".to_string(), json!(pod_ip));
            map.insert("podIPs".to_string(), json!([{"ip": pod_ip}]));
            map.insert("hostIP".to_string(), json!(host_ip));
        }
        (patch, allocated)
    }

    fn release_ip(&self, pod: &Pod, ip: Ipv4Addr) {
        if let Some(pool) = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .and_then(|node| self.pool_for(node))
        {
            pool.release(ip);
        }
    }

    /// The node's IP pool, created lazily from the configured CIDR
    fn pool_for(&self, node_name: &str) -> Option<Arc<IpPool>> {
        if let Some(pool) = self.pools.get(node_name) {
            return Some(Arc::clone(pool.value()));
        }
        match IpPool::new(&self.cidr) {
            Ok(pool) => {
                let pool = Arc::new(pool);
                self.pools
                    .insert(node_name.to_string(), Arc::clone(&pool));
                Some(pool)
            }
            Err(err) => {
                warn!(cidr = %self.cidr, error = %err, "invalid pod CIDR, skipping ip assignment");
                None
            }
        }
    }
}

/// Serialisation key for in-flight dedup: namespace/name
fn dispatch_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_else(|| "default".to_string()),
        pod.name_any()
    )
}

fn pod_ip_of(pod: &Pod) -> Option<Ipv4Addr> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse().ok())
}
