// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the management controller. Every value has a production
//! default, so an empty config file (or none at all) yields a runnable
//! controller; a YAML file may override any subset of fields.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level, per-process configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagementConfig {
    pub network: NetworkConfig,
    pub cluster: ClusterConfig,
    pub policy: PolicyConfig,
    pub scaler: ScalerConfig,
    /// Length of one statistics epoch, in seconds. Policies run once per
    /// epoch.
    pub report_period_secs: u64,
    /// Sentinel written by the bootstrap script once the cluster has finished
    /// spinning up. The controller does not start before it exists.
    pub setup_marker_path: PathBuf,
    /// Kubeconfig consumed by the orchestrator adapter. Defaults to
    /// `~/.kube/config` when unset.
    pub kube_config_path: Option<PathBuf>,
    pub kube_namespace: String,
    pub log_file: PathBuf,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            cluster: ClusterConfig::default(),
            policy: PolicyConfig::default(),
            scaler: ScalerConfig::default(),
            report_period_secs: 5,
            setup_marker_path: PathBuf::from("/hydro/setup_complete"),
            kube_config_path: None,
            kube_namespace: "default".to_string(),
            log_file: PathBuf::from("log_management.txt"),
        }
    }
}

impl ManagementConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_period_secs)
    }

    pub fn kube_config_path(&self) -> PathBuf {
        self.kube_config_path.clone().unwrap_or_else(|| {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")).join(".kube/config")
        })
    }
}

/// Inbound ports bound by the controller, outbound port bases of the other
/// tiers, and the local IPC endpoints of the VM-churn worker.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub restart_port: u16,
    pub churn_port: u16,
    pub list_executors_port: u16,
    pub function_status_port: u16,
    pub list_schedulers_port: u16,
    pub executor_depart_port: u16,
    pub statistics_port: u16,
    pub pin_accept_port: u16,

    pub executor_pin_base: u16,
    pub executor_unpin_base: u16,
    pub executor_depart_base: u16,
    pub storage_depart_base: u16,
    pub routing_seed_base: u16,
    pub routing_notify_base: u16,
    pub monitoring_notify_port: u16,

    pub node_add_path: PathBuf,
    pub node_remove_path: PathBuf,

    /// Cap on cached outbound connections. The cache otherwise grows without
    /// bound under membership churn.
    pub connection_cache_capacity: usize,
    /// Depth of each bounded inbound queue between listener tasks and the
    /// controller loop.
    pub inbound_queue_depth: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            restart_port: 7000,
            churn_port: 7001,
            list_executors_port: 7002,
            function_status_port: 7003,
            list_schedulers_port: 7004,
            executor_depart_port: 7005,
            statistics_port: 7006,
            pin_accept_port: 5010,

            executor_pin_base: 4000,
            executor_unpin_base: 4010,
            executor_depart_base: 4050,
            storage_depart_base: 6050,
            routing_seed_base: 6350,
            routing_notify_base: 6400,
            monitoring_notify_port: 6600,

            node_add_path: PathBuf::from("/tmp/node_add"),
            node_remove_path: PathBuf::from("/tmp/node_remove"),

            connection_cache_capacity: 512,
            inbound_queue_depth: 1024,
        }
    }
}

/// Thread counts assumed for the other tiers' nodes. These must match the
/// deployed images; the controller cannot infer them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub executor_threads: u32,
    pub storage_threads: u32,
    pub routing_threads: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            executor_threads: 3,
            storage_threads: 4,
            routing_threads: 4,
        }
    }
}

/// Tunables for the replica and executor policies.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Average utilization above which executor VMs are added.
    pub max_utilization: f64,
    /// Average utilization below which an executor VM is retired.
    pub min_utilization: f64,
    /// Average pinned-function count above which executor VMs are added.
    pub max_pin_count: f64,
    /// Ratio of current to historical latency above which a function gains
    /// replicas.
    pub max_latency_deviation: f64,
    /// Number of executor VMs added per scale-up decision.
    pub scale_increase: u32,
    /// Seconds after any VM add/remove during which no further elasticity
    /// action is taken.
    pub grace_period_secs: u64,
    /// Per-thread utilization above which the thread's functions are
    /// proactively replicated.
    pub hotspot_utilization: f64,
    /// The executor policy never scales below this many executor VMs.
    pub min_executor_nodes: u32,
    /// Report period of the executors themselves, in seconds. Used to convert
    /// average latency into achievable throughput.
    pub executor_report_period_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_utilization: 0.60,
            min_utilization: 0.10,
            max_pin_count: 0.80,
            max_latency_deviation: 1.25,
            scale_increase: 4,
            grace_period_secs: 120,
            hotspot_utilization: 0.9,
            min_executor_nodes: 5,
            executor_report_period_secs: 5,
        }
    }
}

impl PolicyConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScalerConfig {
    /// Seconds to wait for an executor to acknowledge a pin request before
    /// the candidate is dropped.
    pub pin_ack_timeout_secs: u64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            pin_ack_timeout_secs: 10,
        }
    }
}

impl ScalerConfig {
    pub fn pin_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.pin_ack_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_deployment() {
        let config = ManagementConfig::default();
        assert_eq!(config.report_period_secs, 5);
        assert_eq!(config.network.restart_port, 7000);
        assert_eq!(config.network.statistics_port, 7006);
        assert_eq!(config.network.pin_accept_port, 5010);
        assert_eq!(config.network.executor_pin_base, 4000);
        assert_eq!(config.network.monitoring_notify_port, 6600);
        assert_eq!(config.cluster.executor_threads, 3);
        assert_eq!(config.cluster.storage_threads, 4);
        assert_eq!(config.policy.scale_increase, 4);
        assert_eq!(config.policy.grace_period_secs, 120);
        assert_eq!(config.scaler.pin_ack_timeout_secs, 10);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let yaml = r#"
report_period_secs: 2
policy:
  max_utilization: 0.75
cluster:
  storage_threads: 1
"#;
        let config: ManagementConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.report_period_secs, 2);
        assert_eq!(config.policy.max_utilization, 0.75);
        // Untouched siblings keep their defaults.
        assert_eq!(config.policy.min_utilization, 0.10);
        assert_eq!(config.cluster.storage_threads, 1);
        assert_eq!(config.cluster.routing_threads, 4);
    }

    #[test]
    fn load_reads_yaml_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kube_namespace: cascade").unwrap();
        let config = ManagementConfig::load(file.path()).unwrap();
        assert_eq!(config.kube_namespace, "cascade");
        assert_eq!(config.network.churn_port, 7001);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_yaml::from_str::<ManagementConfig>("reprot_period_secs: 5");
        assert!(err.is_err());
    }
}
