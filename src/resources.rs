//! Stage sources: static configuration and the live Stage CRD
//!
//! Controllers read their rules through a [`LifecycleGetter`]; what sits
//! behind it is either a one-shot compile of statically configured stages
//! or a watcher on the `kwok.x-k8s.io/Stage` CRD that rebuilds the per-kind
//! snapshots on every change. Snapshots are immutable and published by
//! atomic `Arc` swap; readers never observe a partial rule list. Invalid
//! stages are logged and skipped, never fatal.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::Stage;
use crate::lifecycle::{Lifecycle, LifecycleStage};

/// Read access to the current lifecycle snapshot for one resource kind
pub trait LifecycleGetter: Send + Sync {
    /// The current immutable snapshot
    fn get(&self) -> Arc<Lifecycle>;
}

/// A lifecycle compiled once from static configuration
pub struct StaticGetter {
    lifecycle: Arc<Lifecycle>,
}

impl StaticGetter {
    /// Wrap an already-compiled lifecycle
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
        }
    }
}

impl LifecycleGetter for StaticGetter {
    fn get(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }
}

/// Handle onto a snapshot the [`StageStore`] republishes
#[derive(Clone)]
struct SnapshotGetter {
    snapshot: Arc<RwLock<Arc<Lifecycle>>>,
}

impl LifecycleGetter for SnapshotGetter {
    fn get(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.snapshot.read())
    }
}

/// Callback invoked after each snapshot republish
pub type OnRulesChangedFn = Box<dyn Fn() + Send + Sync>;

/// The current set of Stage CRs and the snapshots compiled from it
#[derive(Default)]
pub struct StageStore {
    stages: Mutex<BTreeMap<String, Stage>>,
    node: Arc<RwLock<Arc<Lifecycle>>>,
    pod: Arc<RwLock<Arc<Lifecycle>>>,
    on_changed: Mutex<Option<OnRulesChangedFn>>,
}

impl StageStore {
    /// Create an empty store publishing empty lifecycles
    pub fn new() -> Self {
        Self::default()
    }

    /// Getter for Node-kind stages
    pub fn node_lifecycle(&self) -> Arc<dyn LifecycleGetter> {
        Arc::new(SnapshotGetter {
            snapshot: Arc::clone(&self.node),
        })
    }

    /// Getter for Pod-kind stages
    pub fn pod_lifecycle(&self) -> Arc<dyn LifecycleGetter> {
        Arc::new(SnapshotGetter {
            snapshot: Arc::clone(&self.pod),
        })
    }

    /// Wire a callback fired after every republish, so controllers can
    /// re-dispatch already-cached resources against the new rules without
    /// waiting for their next watch event.
    pub fn set_on_changed(&self, f: OnRulesChangedFn) {
        *self.on_changed.lock() = Some(f);
    }

    /// Record a created or updated Stage and republish
    pub fn apply_stage(&self, stage: Stage) {
        let name = stage.name_any();
        self.stages.lock().insert(name, stage);
        self.rebuild();
    }

    /// Drop a deleted Stage and republish
    pub fn delete_stage(&self, name: &str) {
        self.stages.lock().remove(name);
        self.rebuild();
    }

    /// Replace the whole store (watch restarts) and republish
    pub fn replace_all(&self, stages: Vec<Stage>) {
        let mut store = self.stages.lock();
        store.clear();
        for stage in stages {
            store.insert(stage.name_any(), stage);
        }
        drop(store);
        self.rebuild();
    }

    fn rebuild(&self) {
        let store = self.stages.lock();
        let mut node_stages = Vec::new();
        let mut pod_stages = Vec::new();
        for stage in store.values() {
            let target = match stage.spec.resource_ref.kind.as_str() {
                "Node" => &mut node_stages,
                "Pod" => &mut pod_stages,
                other => {
                    debug!(stage = %stage.name_any(), kind = other, "stage for unhandled kind");
                    continue;
                }
            };
            match LifecycleStage::compile(stage) {
                Ok(compiled) => target.push(Arc::new(compiled)),
                Err(err) => {
                    warn!(stage = %stage.name_any(), error = %err, "skipping invalid stage");
                }
            }
        }
        drop(store);

        *self.node.write() = Arc::new(Lifecycle::new(node_stages));
        *self.pod.write() = Arc::new(Lifecycle::new(pod_stages));

        if let Some(on_changed) = self.on_changed.lock().as_ref() {
            on_changed();
        }
    }
}

/// Watches Stage CRs and feeds a [`StageStore`]
pub struct StageWatcher {
    api: Api<Stage>,
    store: Arc<StageStore>,
}

impl StageWatcher {
    /// Create a watcher over the cluster-scoped Stage CRD
    pub fn new(client: Client, store: Arc<StageStore>) -> Self {
        Self {
            api: Api::all(client),
            store,
        }
    }

    /// Run the watch loop until cancelled.
    ///
    /// Watch failures back off and resync; they never crash the process.
    pub async fn run(self, cancel: CancellationToken) {
        let stream = watcher(self.api, watcher::Config::default().any_semantic())
            .default_backoff();
        tokio::pin!(stream);

        let mut pending: Vec<Stage> = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stage watcher stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(Event::Init)) => pending.clear(),
                    Some(Ok(Event::InitApply(stage))) => pending.push(stage),
                    Some(Ok(Event::InitDone)) => {
                        let count = pending.len();
                        self.store.replace_all(std::mem::take(&mut pending));
                        info!(stages = count, "stage rules synced");
                    }
                    Some(Ok(Event::Apply(stage))) => {
                        info!(stage = %stage.name_any(), "stage rule updated");
                        self.store.apply_stage(stage);
                    }
                    Some(Ok(Event::Delete(stage))) => {
                        info!(stage = %stage.name_any(), "stage rule removed");
                        self.store.delete_stage(&stage.name_any());
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "stage watch error, backing off");
                    }
                    None => {
                        error!("stage watch stream ended unexpectedly");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{StageNext, StageResourceRef, StageSpec};

    fn stage(name: &str, kind: &str) -> Stage {
        Stage::new(
            name,
            StageSpec {
                resource_ref: StageResourceRef {
                    api_group: "v1".into(),
                    kind: kind.into(),
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn splits_snapshots_by_kind() {
        let store = StageStore::new();
        store.replace_all(vec![
            stage("node-init", "Node"),
            stage("pod-running", "Pod"),
            stage("pod-done", "Pod"),
        ]);

        assert_eq!(store.node_lifecycle().get().len(), 1);
        assert_eq!(store.pod_lifecycle().get().len(), 2);
    }

    #[test]
    fn invalid_stages_are_skipped() {
        let store = StageStore::new();
        let mut bad = stage("bad", "Pod");
        bad.spec.next = StageNext {
            status_template: Some("phase: Running".into()),
            status_patch_as_json: Some(serde_json::json!({"phase": "Running"})),
            ..Default::default()
        };
        store.replace_all(vec![bad, stage("good", "Pod")]);

        assert_eq!(store.pod_lifecycle().get().len(), 1);
    }

    #[test]
    fn updates_and_deletes_republish() {
        let store = StageStore::new();
        let getter = store.pod_lifecycle();

        store.apply_stage(stage("a", "Pod"));
        assert_eq!(getter.get().len(), 1);

        store.apply_stage(stage("b", "Pod"));
        assert_eq!(getter.get().len(), 2);

        store.delete_stage("a");
        assert_eq!(getter.get().len(), 1);
    }

    #[test]
    fn readers_hold_consistent_snapshots_across_swaps() {
        let store = StageStore::new();
        store.replace_all(vec![stage("a", "Pod"), stage("b", "Pod")]);

        let getter = store.pod_lifecycle();
        let held = getter.get();
        assert_eq!(held.len(), 2);

        store.replace_all(vec![stage("c", "Pod")]);
        // The held snapshot is unchanged; a fresh read sees the new set.
        assert_eq!(held.len(), 2);
        assert_eq!(getter.get().len(), 1);
    }

    #[test]
    fn empty_store_publishes_empty_lifecycles() {
        let store = StageStore::new();
        assert!(store.node_lifecycle().get().is_empty());
        assert!(store.pod_lifecycle().get().is_empty());
    }

    #[test]
    fn change_callback_fires_on_every_republish() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = StageStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            store.set_on_changed(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        store.apply_stage(stage("a", "Pod"));
        store.delete_stage("a");
        store.replace_all(vec![stage("b", "Node")]);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
