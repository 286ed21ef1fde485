// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use cascade_config::ManagementConfig;
use cascade_management::{
    network::{address::AddressMap, SocketCache},
    orchestrator::KubeOrchestrator,
    policy::DefaultPolicy,
    scaler::DefaultScaler,
    server::{self, ManagementServer},
};
use clap::Parser;
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use tracing::info;

#[derive(Parser)]
#[clap(name = "cascade-management", about = "Cascade cluster management controller")]
struct Args {
    /// Address executors use to reach this controller's pin-accept listener.
    self_ip: String,
    /// YAML config file. Every field is optional; defaults match the
    /// standard cluster deployment.
    #[clap(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ManagementConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ManagementConfig::default(),
    };

    let log_file = std::fs::File::create(&config.log_file)
        .with_context(|| format!("creating log file {}", config.log_file.display()))?;
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(log_file))
        .init();

    // All controller state lives in one task; a single-threaded runtime makes
    // the handlers run strictly one at a time.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the controller runtime")?;
    runtime.block_on(run(args.self_ip, config))
}

async fn run(self_ip: String, config: ManagementConfig) -> anyhow::Result<()> {
    wait_for_file(&config.setup_marker_path).await;
    wait_for_file(&config.kube_config_path()).await;
    info!("startup prerequisites present, binding sockets");

    let client = kube::Client::try_default()
        .await
        .context("connecting to the orchestrator")?;
    let orchestrator = KubeOrchestrator::new(client, config.kube_namespace.clone());

    let channels = server::spawn_listeners(&config.network).await?;
    let scaler = DefaultScaler::new(
        self_ip,
        AddressMap::new(&config.network),
        SocketCache::new(config.network.connection_cache_capacity),
        channels.pin_acks,
        config.scaler.pin_ack_timeout(),
    );
    let policy = DefaultPolicy::new(config.policy.clone(), config.cluster.executor_threads);

    let server = ManagementServer::new(config, orchestrator, scaler, policy);
    server.run(channels.events, channels.statuses).await;
    Ok(())
}

/// The bootstrap scripts create these files when the cluster is ready; until
/// then there is nothing useful to do but wait.
async fn wait_for_file(path: &Path) {
    while !path.exists() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
