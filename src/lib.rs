//! kwok - Kubernetes WithOut Kubelet
//!
//! Simulates large Kubernetes clusters without running kubelets or
//! container runtimes. A single controller process attaches to a real API
//! server, claims ownership of selected Node objects, and drives those
//! Nodes and their Pods through synthetic lifecycles described by
//! declarative Stage rules, so any API-compatible tooling perceives a
//! functioning cluster of thousands of nodes.
//!
//! # Modules
//!
//! - [`crd`] - the `kwok.x-k8s.io/Stage` custom resource
//! - [`lifecycle`] - the compiled stage state machine (match, delay, apply)
//! - [`executor`] - prioritised parallel task executor
//! - [`controller`] - Node, Pod, and node-lease controllers plus wiring
//! - [`resources`] - static and dynamic (CRD-watching) stage sources
//! - [`cache`] - watch-backed Node and Pod indexes
//! - [`ipam`] - Pod IP pools
//! - [`config`] - options, defaults, and the YAML config stream
//! - [`retry`] - backoff for transient API failures
//! - [`selector`] - client-side label-selector matching
//! - [`events`] - Kubernetes Event recording
//! - [`server`] - health endpoint
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod executor;
pub mod ipam;
pub mod lifecycle;
pub mod resources;
pub mod retry;
pub mod selector;
pub mod server;
pub mod yamlconv;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
