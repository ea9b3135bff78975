//! Controller configuration
//!
//! Options come from three layers, later wins: built-in defaults, a YAML
//! config stream (`-c/--config`), then CLI flags with their `KWOK_*`
//! environment fallbacks. The config stream is multi-document: a
//! `KwokConfiguration` document carries options, `Stage` documents become
//! statically configured stages, anything else is skipped with a warning.

use serde::Deserialize;
use tracing::warn;

use crate::crd::Stage;
use crate::error::Error;
use crate::executor::Executor;
use crate::yamlconv;

/// Default CIDR the Pod IP pools draw from
pub const DEFAULT_CIDR: &str = "10.0.0.1/24";
/// Default IP advertised for simulated nodes
pub const DEFAULT_NODE_IP: &str = "196.168.0.1";
/// Default kubelet port advertised for simulated nodes
pub const DEFAULT_NODE_PORT: u16 = 10247;
/// Default node lease duration; zero disables leasing entirely
pub const DEFAULT_NODE_LEASE_DURATION_SECONDS: u32 = 40;
/// Default per-kind stage parallelism
pub const DEFAULT_PLAY_STAGE_PARALLELISM: usize = 4;

/// Resolved controller options
#[derive(Clone, Debug)]
pub struct Options {
    /// Path to a kubeconfig; empty means in-cluster or `--master`
    pub kubeconfig: String,
    /// API server address overriding the kubeconfig
    pub master: String,
    /// CIDR for Pod IP allocation
    pub cidr: String,
    /// IP of all simulated nodes
    pub node_ip: String,
    /// If non-empty, a Node the controller creates and manages itself
    pub node_name: String,
    /// Kubelet port of all simulated nodes
    pub node_port: u16,
    /// Manage every Node in the cluster
    pub manage_all_nodes: bool,
    /// Manage Nodes whose annotations match this selector
    pub manage_nodes_with_annotation_selector: String,
    /// Manage Nodes whose labels match this selector (server-side filter)
    pub manage_nodes_with_label_selector: String,
    /// Never write `.status` of resources matching this annotation selector
    pub disregard_status_with_annotation_selector: String,
    /// Never write `.status` of resources matching this label selector
    pub disregard_status_with_label_selector: String,
    /// Node lease duration in seconds; zero disables the lease controller
    pub node_lease_duration_seconds: u32,
    /// Record co-holders in the lease annotation instead of excluding them.
    /// Cooperative awareness only: listed holders all manage the node, no
    /// mutual exclusion between them is enforced.
    pub enable_node_lease_shareable: bool,
    /// Leave Pod IPs to the host network stack instead of the CIDR pool
    pub enable_cni: bool,
    /// Concurrent stage applications for Pods
    pub pod_play_stage_parallelism: usize,
    /// Concurrent stage applications for Nodes
    pub node_play_stage_parallelism: usize,
    /// Concurrent lease operations
    pub node_lease_parallelism: usize,
    /// Total executor workers
    pub total_parallel: usize,
    /// Custom resource kinds to watch; `Stage` forces dynamic loading
    pub enable_crds: Vec<String>,
    /// Address of the health endpoint; empty disables it
    pub server_address: String,
    /// x509 certificate for the health endpoint
    pub tls_cert_file: String,
    /// x509 private key for the health endpoint
    pub tls_private_key_file: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            kubeconfig: String::new(),
            master: String::new(),
            cidr: DEFAULT_CIDR.to_string(),
            node_ip: DEFAULT_NODE_IP.to_string(),
            node_name: String::new(),
            node_port: DEFAULT_NODE_PORT,
            manage_all_nodes: false,
            manage_nodes_with_annotation_selector: String::new(),
            manage_nodes_with_label_selector: String::new(),
            disregard_status_with_annotation_selector: String::new(),
            disregard_status_with_label_selector: String::new(),
            node_lease_duration_seconds: DEFAULT_NODE_LEASE_DURATION_SECONDS,
            enable_node_lease_shareable: false,
            enable_cni: false,
            pod_play_stage_parallelism: DEFAULT_PLAY_STAGE_PARALLELISM,
            node_play_stage_parallelism: DEFAULT_PLAY_STAGE_PARALLELISM,
            node_lease_parallelism: DEFAULT_PLAY_STAGE_PARALLELISM,
            total_parallel: Executor::default_parallelism(),
            enable_crds: Vec::new(),
            server_address: String::new(),
            tls_cert_file: String::new(),
            tls_private_key_file: String::new(),
        }
    }
}

impl Options {
    /// Overlay non-empty values from a config file document
    pub fn merge_file(&mut self, file: OptionsFile) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = file.$field {
                    self.$field = v;
                }
            };
        }
        take!(kubeconfig);
        take!(master);
        take!(cidr);
        take!(node_ip);
        take!(node_name);
        take!(node_port);
        take!(manage_all_nodes);
        take!(manage_nodes_with_annotation_selector);
        take!(manage_nodes_with_label_selector);
        take!(disregard_status_with_annotation_selector);
        take!(disregard_status_with_label_selector);
        take!(node_lease_duration_seconds);
        take!(enable_node_lease_shareable);
        take!(enable_cni);
        take!(pod_play_stage_parallelism);
        take!(node_play_stage_parallelism);
        take!(node_lease_parallelism);
        take!(total_parallel);
        take!(enable_crds);
        take!(server_address);
        take!(tls_cert_file);
        take!(tls_private_key_file);
    }

    /// Validate the combination of manage selectors.
    ///
    /// `manageAllNodes` overrides both selectors; otherwise at least one
    /// selector must be set, or no node would ever be managed.
    pub fn validate_manage_selectors(&mut self) -> Result<(), Error> {
        if self.manage_all_nodes {
            self.manage_nodes_with_annotation_selector.clear();
            self.manage_nodes_with_label_selector.clear();
            return Ok(());
        }
        if self.manage_nodes_with_annotation_selector.is_empty()
            && self.manage_nodes_with_label_selector.is_empty()
        {
            return Err(Error::config("no nodes are managed"));
        }
        Ok(())
    }

    /// True if dynamic Stage loading is in effect
    pub fn stage_crd_enabled(&self) -> bool {
        self.enable_crds.iter().any(|k| k == "Stage")
    }
}

/// `options` block of a `KwokConfiguration` document; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsFile {
    kubeconfig: Option<String>,
    master: Option<String>,
    cidr: Option<String>,
    #[serde(rename = "nodeIP")]
    node_ip: Option<String>,
    node_name: Option<String>,
    node_port: Option<u16>,
    manage_all_nodes: Option<bool>,
    manage_nodes_with_annotation_selector: Option<String>,
    manage_nodes_with_label_selector: Option<String>,
    disregard_status_with_annotation_selector: Option<String>,
    disregard_status_with_label_selector: Option<String>,
    node_lease_duration_seconds: Option<u32>,
    enable_node_lease_shareable: Option<bool>,
    #[serde(rename = "enableCNI")]
    enable_cni: Option<bool>,
    pod_play_stage_parallelism: Option<usize>,
    node_play_stage_parallelism: Option<usize>,
    node_lease_parallelism: Option<usize>,
    total_parallel: Option<usize>,
    #[serde(rename = "enableCRDs")]
    enable_crds: Option<Vec<String>>,
    server_address: Option<String>,
    tls_cert_file: Option<String>,
    tls_private_key_file: Option<String>,
}

/// Everything a config stream can carry
#[derive(Debug, Default)]
pub struct ConfigFile {
    /// Option overlays, in document order
    pub options: Vec<OptionsFile>,
    /// Statically configured stages
    pub stages: Vec<Stage>,
}

#[derive(Debug, Deserialize)]
struct KwokConfigurationDoc {
    #[serde(default)]
    options: OptionsFile,
}

/// Parse a multi-document YAML config stream.
///
/// Unknown kinds are skipped with a warning; a document that fails to
/// deserialize as its declared kind is a configuration error.
pub fn load_stream(input: &str) -> Result<ConfigFile, Error> {
    let mut out = ConfigFile::default();
    for doc in yamlconv::parse_yaml_multi(input)? {
        if doc.is_null() {
            continue;
        }
        let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
        match kind {
            "KwokConfiguration" => {
                let parsed: KwokConfigurationDoc = serde_json::from_value(doc)
                    .map_err(|e| Error::config(format!("bad KwokConfiguration: {e}")))?;
                out.options.push(parsed.options);
            }
            "Stage" => {
                let stage: Stage = serde_json::from_value(doc)
                    .map_err(|e| Error::config(format!("bad Stage: {e}")))?;
                out.stages.push(stage);
            }
            "" => {
                return Err(Error::config("config document without kind"));
            }
            // Valid kinds consumed by other tooling, not by this controller.
            "Attach" | "ClusterAttach" | "Logs" | "ClusterLogs" => {
                tracing::debug!(kind, "config document handled by an external subsystem");
            }
            other => {
                warn!(kind = other, "skipping unrecognized config document");
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipped_values() {
        let opts = Options::default();
        assert_eq!(opts.cidr, "10.0.0.1/24");
        assert_eq!(opts.node_ip, "196.168.0.1");
        assert_eq!(opts.node_port, 10247);
        assert_eq!(opts.node_lease_duration_seconds, 40);
        assert_eq!(opts.pod_play_stage_parallelism, 4);
        assert!(!opts.manage_all_nodes);
    }

    #[test]
    fn stream_splits_configuration_and_stages() {
        let stream = r#"
kind: KwokConfiguration
apiVersion: config.kwok.x-k8s.io/v1alpha1
options:
  manageAllNodes: true
  nodeLeaseDurationSeconds: 10
  enableCNI: true
---
kind: Stage
apiVersion: kwok.x-k8s.io/v1alpha1
metadata:
  name: pod-running
spec:
  resourceRef:
    kind: Pod
  next:
    statusTemplate: "phase: Running"
"#;
        let file = load_stream(stream).unwrap();
        assert_eq!(file.options.len(), 1);
        assert_eq!(file.stages.len(), 1);
        assert_eq!(file.stages[0].metadata.name.as_deref(), Some("pod-running"));

        let mut opts = Options::default();
        for overlay in file.options {
            opts.merge_file(overlay);
        }
        assert!(opts.manage_all_nodes);
        assert!(opts.enable_cni);
        assert_eq!(opts.node_lease_duration_seconds, 10);
        // Untouched fields keep their defaults.
        assert_eq!(opts.cidr, "10.0.0.1/24");
    }

    #[test]
    fn unknown_kinds_are_skipped_not_fatal() {
        let stream = "kind: ClusterAttach\nmetadata:\n  name: x\n";
        let file = load_stream(stream).unwrap();
        assert!(file.options.is_empty());
        assert!(file.stages.is_empty());
    }

    #[test]
    fn kindless_documents_are_rejected() {
        assert!(load_stream("foo: bar\n").is_err());
    }

    #[test]
    fn manage_all_nodes_clears_selectors() {
        let mut opts = Options {
            manage_all_nodes: true,
            manage_nodes_with_label_selector: "type=kwok".into(),
            ..Default::default()
        };
        opts.validate_manage_selectors().unwrap();
        assert!(opts.manage_nodes_with_label_selector.is_empty());
    }

    #[test]
    fn refusing_to_manage_nothing() {
        let mut opts = Options::default();
        let err = opts.validate_manage_selectors().unwrap_err();
        assert!(err.to_string().contains("no nodes are managed"));

        let mut opts = Options {
            manage_nodes_with_annotation_selector: "kwok.x-k8s.io/node=fake".into(),
            ..Default::default()
        };
        assert!(opts.validate_manage_selectors().is_ok());
    }

    #[test]
    fn stage_crd_switch() {
        let mut opts = Options::default();
        assert!(!opts.stage_crd_enabled());
        opts.enable_crds = vec!["Stage".into()];
        assert!(opts.stage_crd_enabled());
    }
}
