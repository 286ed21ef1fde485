// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

use cascade_config::NetworkConfig;

/// Deterministic mapping from (node ip, thread id, role) to endpoint strings.
///
/// Every tier binds one port per worker thread at a fixed base, so an
/// endpoint is always `base + tid`. The monitoring tier listens on a single
/// port regardless of thread count.
#[derive(Clone, Debug)]
pub struct AddressMap {
    executor_pin_base: u16,
    executor_unpin_base: u16,
    executor_depart_base: u16,
    storage_depart_base: u16,
    routing_seed_base: u16,
    routing_notify_base: u16,
    monitoring_notify_port: u16,
    node_add: String,
    node_remove: String,
}

fn tcp(ip: &str, port: u32) -> String {
    format!("tcp://{ip}:{port}")
}

impl AddressMap {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            executor_pin_base: config.executor_pin_base,
            executor_unpin_base: config.executor_unpin_base,
            executor_depart_base: config.executor_depart_base,
            storage_depart_base: config.storage_depart_base,
            routing_seed_base: config.routing_seed_base,
            routing_notify_base: config.routing_notify_base,
            monitoring_notify_port: config.monitoring_notify_port,
            node_add: format!("ipc://{}", config.node_add_path.display()),
            node_remove: format!("ipc://{}", config.node_remove_path.display()),
        }
    }

    pub fn executor_pin(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.executor_pin_base as u32 + tid)
    }

    pub fn executor_unpin(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.executor_unpin_base as u32 + tid)
    }

    pub fn executor_depart(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.executor_depart_base as u32 + tid)
    }

    pub fn storage_depart(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.storage_depart_base as u32 + tid)
    }

    pub fn routing_seed(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.routing_seed_base as u32 + tid)
    }

    pub fn routing_notify(&self, ip: &str, tid: u32) -> String {
        tcp(ip, self.routing_notify_base as u32 + tid)
    }

    pub fn monitoring_notify(&self, ip: &str) -> String {
        tcp(ip, self.monitoring_notify_port as u32)
    }

    /// Local IPC endpoint of the VM-churn worker's add queue.
    pub fn node_add(&self) -> &str {
        &self.node_add
    }

    /// Local IPC endpoint of the VM-churn worker's remove queue.
    pub fn node_remove(&self) -> &str {
        &self.node_remove
    }
}
