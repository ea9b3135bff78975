//! Watch-backed resource caches
//!
//! Thin projections over what the informers deliver: Nodes indexed by name,
//! Pods indexed by `(node, uid)`. Entries are immutable `Arc` snapshots
//! replaced atomically per key; mutations always flow through PATCH on the
//! API, never through cache writes.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Cached view of a Node this controller has seen
#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Owner references, propagated onto the Node's lease
    pub owner_references: Vec<OwnerReference>,
    /// Host IPs advertised in `.status.addresses`
    pub host_ips: Vec<String>,
    /// Containers started on this node by the Pod controller.
    ///
    /// Shared across snapshot replacements: clones hand out the same
    /// counter, so the tally survives watch-event updates of the entry.
    pub started_containers: Arc<AtomicU64>,
}

/// Cached view of a Pod, including the full object for replay
#[derive(Clone, Debug)]
pub struct PodInfo {
    /// Pod UID, the partition key within a node
    pub uid: String,
    /// Node the pod is scheduled to
    pub node_name: String,
    /// Last observed object, replayed when a node becomes managed
    pub pod: Pod,
}

/// Nodes indexed by name
#[derive(Default)]
pub struct NodeIndex {
    inner: DashMap<String, Arc<NodeInfo>>,
}

impl NodeIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for a node.
    ///
    /// The started-container counter carries over from the previous
    /// snapshot; everything else is taken from the new projection.
    pub fn put(&self, mut info: NodeInfo) {
        let previous_counter = self
            .inner
            .get(&info.name)
            .map(|e| Arc::clone(&e.started_containers));
        if let Some(counter) = previous_counter {
            info.started_containers = counter;
        }
        self.inner.insert(info.name.clone(), Arc::new(info));
    }

    /// Look up a node by name
    pub fn get(&self, name: &str) -> Option<Arc<NodeInfo>> {
        self.inner.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Remove a node, returning its last snapshot
    pub fn remove(&self, name: &str) -> Option<Arc<NodeInfo>> {
        self.inner.remove(name).map(|(_, v)| v)
    }

    /// True if the node is present
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Snapshot of all cached nodes
    pub fn list(&self) -> Vec<Arc<NodeInfo>> {
        self.inner.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of cached nodes
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if no nodes are cached
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Pods partitioned by node name, then keyed by UID
#[derive(Default)]
pub struct PodIndex {
    inner: DashMap<String, HashMap<String, Arc<PodInfo>>>,
}

impl PodIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for a pod within its node partition.
    ///
    /// If the pod moved between nodes (UID reuse across recreate), the
    /// stale entry under the old node is left to its own delete event.
    pub fn put(&self, info: PodInfo) {
        let mut partition = self.inner.entry(info.node_name.clone()).or_default();
        partition.insert(info.uid.clone(), Arc::new(info));
    }

    /// Look up a pod by node and UID
    pub fn get(&self, node_name: &str, uid: &str) -> Option<Arc<PodInfo>> {
        self.inner
            .get(node_name)
            .and_then(|p| p.get(uid).map(Arc::clone))
    }

    /// Remove a pod, dropping the partition when it empties
    pub fn remove(&self, node_name: &str, uid: &str) -> Option<Arc<PodInfo>> {
        let removed = self
            .inner
            .get_mut(node_name)
            .and_then(|mut p| p.remove(uid));
        self.inner
            .remove_if(node_name, |_, partition| partition.is_empty());
        removed
    }

    /// Names of all nodes with at least one cached pod
    pub fn node_names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all pods on one node
    pub fn list_on_node(&self, node_name: &str) -> Vec<Arc<PodInfo>> {
        self.inner
            .get(node_name)
            .map(|p| p.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Total number of cached pods
    pub fn len(&self) -> usize {
        self.inner.iter().map(|e| e.value().len()).sum()
    }

    /// True if no pods are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_info(node: &str, uid: &str) -> PodInfo {
        PodInfo {
            uid: uid.into(),
            node_name: node.into(),
            pod: Pod::default(),
        }
    }

    #[test]
    fn node_entries_replace_atomically() {
        let index = NodeIndex::new();
        index.put(NodeInfo {
            name: "n0".into(),
            host_ips: vec!["10.1.0.1".into()],
            ..Default::default()
        });
        index.put(NodeInfo {
            name: "n0".into(),
            host_ips: vec!["10.1.0.2".into()],
            ..Default::default()
        });

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("n0").unwrap().host_ips, vec!["10.1.0.2"]);
        assert!(index.get("n1").is_none());
    }

    #[test]
    fn readers_keep_their_snapshot_across_replace() {
        let index = NodeIndex::new();
        index.put(NodeInfo {
            name: "n0".into(),
            host_ips: vec!["10.1.0.1".into()],
            ..Default::default()
        });
        let snapshot = index.get("n0").unwrap();
        index.put(NodeInfo {
            name: "n0".into(),
            host_ips: vec!["10.1.0.2".into()],
            ..Default::default()
        });
        // The old Arc still reads consistently.
        assert_eq!(snapshot.host_ips, vec!["10.1.0.1"]);
    }

    #[test]
    fn started_container_counter_survives_entry_replacement() {
        use std::sync::atomic::Ordering;

        let index = NodeIndex::new();
        index.put(NodeInfo {
            name: "n0".into(),
            ..Default::default()
        });
        index
            .get("n0")
            .unwrap()
            .started_containers
            .fetch_add(3, Ordering::Relaxed);

        // A watch event replaces the snapshot; the tally is kept.
        index.put(NodeInfo {
            name: "n0".into(),
            host_ips: vec!["10.1.0.2".into()],
            ..Default::default()
        });
        let info = index.get("n0").unwrap();
        assert_eq!(info.host_ips, vec!["10.1.0.2"]);
        assert_eq!(info.started_containers.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn pods_partition_by_node() {
        let index = PodIndex::new();
        index.put(pod_info("n0", "uid-a"));
        index.put(pod_info("n0", "uid-b"));
        index.put(pod_info("n1", "uid-c"));

        assert_eq!(index.list_on_node("n0").len(), 2);
        assert_eq!(index.list_on_node("n1").len(), 1);
        assert!(index.list_on_node("n2").is_empty());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn removing_last_pod_drops_the_partition() {
        let index = PodIndex::new();
        index.put(pod_info("n0", "uid-a"));
        assert!(index.remove("n0", "uid-a").is_some());
        assert!(index.remove("n0", "uid-a").is_none());
        assert!(index.is_empty());
    }
}
