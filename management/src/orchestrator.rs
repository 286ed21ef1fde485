// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of the container orchestrator: which pods exist per role,
//! and how often they have restarted. The controller never mutates cluster
//! state through this interface; it only observes it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    Client,
};
use thiserror::Error;

/// Role labels attached to Cascade pods by the cluster bootstrap.
pub mod roles {
    pub const EBS: &str = "ebs";
    pub const FUNCTION: &str = "function";
    pub const GPU: &str = "gpu";
    pub const MEMORY: &str = "memory";
    pub const MONITORING: &str = "monitoring";
    pub const ROUTING: &str = "routing";
    pub const SCHEDULER: &str = "scheduler";
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("no pod with ip {0}")]
    PodNotFound(String),
    #[error("pod {0} reports no container statuses")]
    NoContainerStatus(String),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// IPs of all pods carrying `role=<role>`. With `running_only`, pods not
    /// yet (or no longer) in the `Running` phase are filtered out.
    async fn pod_ips(&self, role: &str, running_only: bool) -> Result<Vec<String>, OrchestratorError>;

    /// Restart count of the first container of the pod with the given IP.
    async fn restart_count(&self, pod_ip: &str) -> Result<i32, OrchestratorError>;
}

/// Production implementation over the Kubernetes API server.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn pod_ips(&self, role: &str, running_only: bool) -> Result<Vec<String>, OrchestratorError> {
        let params = ListParams::default().labels(&format!("role={role}"));
        let pods = self.pods().list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let status = pod.status?;
                if running_only && status.phase.as_deref() != Some("Running") {
                    return None;
                }
                status.pod_ip
            })
            .collect())
    }

    async fn restart_count(&self, pod_ip: &str) -> Result<i32, OrchestratorError> {
        let pods = self.pods().list(&ListParams::default()).await?;
        for pod in pods.items {
            let status = match pod.status {
                Some(status) => status,
                None => continue,
            };
            if status.pod_ip.as_deref() != Some(pod_ip) {
                continue;
            }
            return status
                .container_statuses
                .as_ref()
                .and_then(|statuses| statuses.first())
                .map(|container| container.restart_count)
                .ok_or_else(|| OrchestratorError::NoContainerStatus(pod_ip.to_string()));
        }
        Err(OrchestratorError::PodNotFound(pod_ip.to_string()))
    }
}
