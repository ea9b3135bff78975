//! kwok controller binary
//!
//! Attaches to one Kubernetes API server and simulates the Nodes selected
//! by the manage flags, plus every Pod scheduled onto them.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kwok::config::{load_stream, Options};
use kwok::controller::{identity, Controller, ControllerConfig};
use kwok::server;
use kwok::Error;

/// kwok - simulate Kubernetes nodes and pods without kubelets
#[derive(Parser, Debug)]
#[command(name = "kwok", version, about, long_about = None)]
struct Cli {
    /// Path to a config YAML stream (KwokConfiguration and Stage documents)
    #[arg(short = 'c', long, env = "KWOK_CONFIG")]
    config: Option<String>,

    /// Path to the kubeconfig file to use
    #[arg(long, env = "KWOK_KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Address of the Kubernetes API server, overriding the kubeconfig
    #[arg(long, env = "KWOK_MASTER")]
    master: Option<String>,

    /// Manage every Node in the cluster
    #[arg(long, env = "KWOK_MANAGE_ALL_NODES", num_args = 0..=1, default_missing_value = "true")]
    manage_all_nodes: Option<bool>,

    /// Manage Nodes whose labels match this selector
    #[arg(long, env = "KWOK_MANAGE_NODES_WITH_LABEL_SELECTOR")]
    manage_nodes_with_label_selector: Option<String>,

    /// Manage Nodes whose annotations match this selector
    #[arg(long, env = "KWOK_MANAGE_NODES_WITH_ANNOTATION_SELECTOR")]
    manage_nodes_with_annotation_selector: Option<String>,

    /// Never write status of resources whose labels match this selector
    #[arg(long, env = "KWOK_DISREGARD_STATUS_WITH_LABEL_SELECTOR")]
    disregard_status_with_label_selector: Option<String>,

    /// Never write status of resources whose annotations match this selector
    #[arg(long, env = "KWOK_DISREGARD_STATUS_WITH_ANNOTATION_SELECTOR")]
    disregard_status_with_annotation_selector: Option<String>,

    /// Node lease duration in seconds; 0 disables lease-based ownership
    #[arg(long, env = "KWOK_NODE_LEASE_DURATION_SECONDS")]
    node_lease_duration_seconds: Option<u32>,

    /// Record lease co-holders instead of excluding them (hot standby)
    #[arg(long, env = "KWOK_ENABLE_NODE_LEASE_SHAREABLE", num_args = 0..=1, default_missing_value = "true")]
    enable_node_lease_shareable: Option<bool>,

    /// Leave Pod IPs to the host network stack instead of the CIDR pool
    #[arg(long = "experimental-enable-cni", env = "KWOK_EXPERIMENTAL_ENABLE_CNI", num_args = 0..=1, default_missing_value = "true")]
    enable_cni: Option<bool>,

    /// CIDR Pod IPs are allocated from
    #[arg(long, env = "KWOK_CIDR")]
    cidr: Option<String>,

    /// IP of all simulated nodes
    #[arg(long, env = "KWOK_NODE_IP")]
    node_ip: Option<String>,

    /// If set, a Node the controller creates and manages itself
    #[arg(long, env = "KWOK_NODE_NAME")]
    node_name: Option<String>,

    /// Kubelet port of all simulated nodes
    #[arg(long, env = "KWOK_NODE_PORT")]
    node_port: Option<u16>,

    /// Custom resource kinds to enable (repeatable); `Stage` forces
    /// dynamic rule loading even when stages are configured statically
    #[arg(long = "enable-crd", env = "KWOK_ENABLE_CRD")]
    enable_crd: Vec<String>,

    /// Address to serve /healthz on; empty disables the server
    #[arg(long, env = "KWOK_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// File containing the x509 certificate for the health endpoint
    #[arg(long, env = "KWOK_TLS_CERT_FILE")]
    tls_cert_file: Option<String>,

    /// File containing the x509 private key for the health endpoint
    #[arg(long, env = "KWOK_TLS_PRIVATE_KEY_FILE")]
    tls_private_key_file: Option<String>,

    /// Log verbosity: 0 info, 1-3 debug, 4+ trace
    #[arg(short = 'v', env = "KWOK_V", default_value_t = 0)]
    verbosity: u8,
}

impl Cli {
    /// Fold CLI/env values over the resolved options; flags win.
    fn apply(&self, options: &mut Options) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = &self.$field {
                    options.$field = v.clone();
                }
            };
        }
        take!(kubeconfig);
        take!(master);
        take!(cidr);
        take!(node_ip);
        take!(node_name);
        take!(manage_nodes_with_label_selector);
        take!(manage_nodes_with_annotation_selector);
        take!(disregard_status_with_label_selector);
        take!(disregard_status_with_annotation_selector);
        take!(server_address);
        take!(tls_cert_file);
        take!(tls_private_key_file);
        if let Some(v) = self.node_port {
            options.node_port = v;
        }
        if let Some(v) = self.manage_all_nodes {
            options.manage_all_nodes = v;
        }
        if let Some(v) = self.node_lease_duration_seconds {
            options.node_lease_duration_seconds = v;
        }
        if let Some(v) = self.enable_node_lease_shareable {
            options.enable_node_lease_shareable = v;
        }
        if let Some(v) = self.enable_cni {
            options.enable_cni = v;
        }
        if !self.enable_crd.is_empty() {
            options.enable_crds = self.enable_crd.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    // Must precede any TLS use, including the kube client.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (controller, options) = match startup(&cli, &cancel).await {
        Ok(started) => started,
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::from(1);
        }
    };

    match run(controller, options, cancel).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1..=3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kwok={default_level},warn")));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(err) => {
                        error!(error = %err, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }
        cancel.cancel();
    });
}

async fn startup(cli: &Cli, cancel: &CancellationToken) -> Result<(Controller, Options), Error> {
    let mut options = Options::default();
    let mut stages = Vec::new();
    if let Some(path) = &cli.config {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
        let file = load_stream(&raw)?;
        for overlay in file.options {
            options.merge_file(overlay);
        }
        stages = file.stages;
    }
    cli.apply(&mut options);
    options.validate_manage_selectors()?;

    let client = build_client(&options).await?;
    let id = identity();
    info!(id = %id, "starting kwok controller");

    let controller = Controller::start(
        ControllerConfig {
            client,
            options: options.clone(),
            stages,
            id,
        },
        cancel.clone(),
    )
    .await?;
    Ok((controller, options))
}

async fn build_client(options: &Options) -> Result<Client, Error> {
    let mut config = if !options.kubeconfig.is_empty() {
        let kubeconfig = Kubeconfig::read_from(&options.kubeconfig)
            .map_err(|e| Error::config(format!("bad kubeconfig: {e}")))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("bad kubeconfig: {e}")))?
    } else {
        Config::infer()
            .await
            .map_err(|e| Error::config(format!("cannot infer cluster config: {e}")))?
    };
    if !options.master.is_empty() {
        config.cluster_url = options
            .master
            .parse()
            .map_err(|e| Error::config(format!("bad --master address: {e}")))?;
    }
    Ok(Client::try_from(config)?)
}

async fn run(
    controller: Controller,
    options: Options,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let health = if options.server_address.is_empty() {
        None
    } else {
        let addr: SocketAddr = options
            .server_address
            .parse()
            .map_err(|e| Error::config(format!("bad --server-address: {e}")))?;
        let cert = (!options.tls_cert_file.is_empty()).then_some(options.tls_cert_file.clone());
        let key = (!options.tls_private_key_file.is_empty())
            .then_some(options.tls_private_key_file.clone());
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            server::serve(addr, cert.as_deref(), key.as_deref(), cancel).await
        }))
    };

    cancel.cancelled().await;
    info!("shutting down, releasing leases");
    controller.shutdown().await;

    if let Some(health) = health {
        match health.await {
            Ok(result) => result?,
            Err(err) if err.is_panic() => {
                return Err(Error::startup(format!("health server panicked: {err}")))
            }
            Err(_) => {}
        }
    }
    Ok(())
}
