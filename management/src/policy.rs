// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-epoch control decisions: how many replicas each function should have,
//! and how many executor VMs the cluster should run.

use crate::scaler::{ExecutorPool, Scaler, VmKind};
use async_trait::async_trait;
use cascade_config::PolicyConfig;
use cascade_types::{ExecutorKey, ExecutorType, ThreadStatus};
use rand::seq::IteratorRandom;
use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};
use tracing::{info, warn};

#[async_trait]
pub trait Policy<S: Scaler>: Send {
    /// Decides how many replicas of each reporting function should exist,
    /// from call frequencies, runtimes, and the historical latency record.
    /// Assumes the executor policy provides enough threads to place them.
    async fn replica_policy(
        &mut self,
        scaler: &mut S,
        function_frequencies: &HashMap<String, u64>,
        function_runtimes: &HashMap<String, (f64, u64)>,
        dag_runtimes: &HashMap<String, Vec<f64>>,
        executor_statuses: &HashMap<ExecutorKey, ThreadStatus>,
        arrival_times: &HashMap<String, Vec<f64>>,
    );

    /// Decides how many executor VMs to add or remove, from aggregate
    /// utilization and pin pressure across all reporting threads.
    async fn executor_policy(
        &mut self,
        scaler: &mut S,
        executor_statuses: &mut HashMap<ExecutorKey, ThreadStatus>,
        departing_executors: &mut HashMap<String, u32>,
    );
}

pub struct DefaultPolicy {
    config: PolicyConfig,
    executor_threads: u32,
    /// Set whenever a VM is added or removed; both elasticity paths stay
    /// quiet until the grace period has passed, so one decision's effect is
    /// visible before the next is taken.
    grace_start: Option<Instant>,
    /// Running average latency and sample count per function. Survives across
    /// epochs.
    latency_history: HashMap<String, (f64, u64)>,
    /// Reverse index from function to the threads hosting it. Rebuilt from
    /// the status table on every replica-policy run.
    function_locations: HashMap<String, HashSet<ExecutorKey>>,
}

impl DefaultPolicy {
    pub fn new(config: PolicyConfig, executor_threads: u32) -> Self {
        Self {
            config,
            executor_threads,
            grace_start: None,
            latency_history: HashMap::new(),
            function_locations: HashMap::new(),
        }
    }
}

#[async_trait]
impl<S: Scaler> Policy<S> for DefaultPolicy {
    async fn replica_policy(
        &mut self,
        scaler: &mut S,
        function_frequencies: &HashMap<String, u64>,
        function_runtimes: &HashMap<String, (f64, u64)>,
        _dag_runtimes: &HashMap<String, Vec<f64>>,
        executor_statuses: &HashMap<ExecutorKey, ThreadStatus>,
        _arrival_times: &HashMap<String, Vec<f64>>,
    ) {
        self.function_locations.clear();
        for (key, status) in executor_statuses {
            for fname in &status.functions {
                self.function_locations.entry(fname.clone()).or_default().insert(key.clone());
            }
        }

        let mut cpu = HashSet::new();
        let mut gpu = HashSet::new();
        for (key, status) in executor_statuses {
            match status.executor_type() {
                ExecutorType::Cpu => cpu.insert(key.clone()),
                ExecutorType::Gpu => gpu.insert(key.clone()),
            };
        }
        let pool = ExecutorPool::Partitioned { cpu, gpu };

        for (fname, &call_count) in function_frequencies {
            let (runtime_sum, runtime_count) =
                function_runtimes.get(fname).copied().unwrap_or((0.0, 0));
            if call_count == 0 || runtime_sum == 0.0 || runtime_count == 0 {
                continue;
            }
            let num_replicas = match self.function_locations.get(fname) {
                Some(locations) if !locations.is_empty() => locations.len() as u64,
                _ => {
                    warn!(
                        function = %fname,
                        "load reported for a function with no known replicas, skipping"
                    );
                    continue;
                },
            };

            let avg_latency = runtime_sum / runtime_count as f64;
            let throughput =
                num_replicas as f64 * self.config.executor_report_period_secs as f64 / avg_latency;
            let (historical, historical_count) =
                self.latency_history.get(fname).copied().unwrap_or((0.0, 0));

            info!(
                function = %fname,
                calls = call_count,
                avg_latency,
                throughput,
                replicas = num_replicas,
                "function load for the epoch"
            );

            let calls = call_count as f64;
            if calls > throughput * 0.7 {
                let increase =
                    (calls / (throughput * 0.7)).ceil() as u64 * num_replicas - num_replicas + 1;
                info!(
                    function = %fname,
                    calls = call_count,
                    adding = increase,
                    "call volume exceeds capacity, adding replicas"
                );
                scaler
                    .replicate_function(fname, increase, &mut self.function_locations, &pool)
                    .await;
            } else if calls < throughput * 0.1 {
                // The raw call count can undershoot while executor reports
                // are still trickling in, so the reduction target keeps
                // slack above the proportional share.
                let decrease = ((calls / throughput) * num_replicas as f64).ceil() as u64 + 1;
                info!(
                    function = %fname,
                    calls = call_count,
                    target = decrease,
                    "call volume under threshold, reducing replicas"
                );
                scaler.dereplicate_function(fname, decrease, &mut self.function_locations).await;
            } else if self.latency_history.contains_key(fname) {
                let ratio = avg_latency / historical;
                if ratio > self.config.max_latency_deviation {
                    let increase =
                        (ratio * num_replicas as f64).ceil() as u64 - num_replicas + 1;
                    info!(
                        function = %fname,
                        avg_latency,
                        ratio,
                        adding = increase,
                        "latency drifted above the historical average, adding replicas"
                    );
                    scaler
                        .replicate_function(fname, increase, &mut self.function_locations, &pool)
                        .await;
                }
            }

            let merged_runtime = runtime_sum + historical * historical_count as f64;
            let merged_count = runtime_count + historical_count;
            self.latency_history
                .insert(fname.clone(), (merged_runtime / merged_count as f64, merged_count));
        }
    }

    async fn executor_policy(
        &mut self,
        scaler: &mut S,
        executor_statuses: &mut HashMap<ExecutorKey, ThreadStatus>,
        departing_executors: &mut HashMap<String, u32>,
    ) {
        if executor_statuses.is_empty() {
            return;
        }
        if let Some(grace_start) = self.grace_start {
            if grace_start.elapsed() < self.config.grace_period() {
                return;
            }
        }

        let thread_count = executor_statuses.len();
        let utilization_sum: f64 =
            executor_statuses.values().map(|status| status.utilization).sum();
        let pinned_function_count: usize =
            executor_statuses.values().map(|status| status.functions.len()).sum();
        let avg_utilization = utilization_sum / thread_count as f64;
        let avg_pinned_count = pinned_function_count as f64 / thread_count as f64;
        let num_nodes = thread_count as f64 / self.executor_threads as f64;

        info!(
            nodes = num_nodes as u64,
            threads = thread_count,
            avg_utilization,
            avg_pinned_count,
            "executor load for the epoch"
        );

        if avg_utilization > self.config.max_utilization
            || avg_pinned_count > self.config.max_pin_count
        {
            info!(
                avg_utilization,
                adding = self.config.scale_increase,
                "average load above threshold, adding executor nodes"
            );
            scaler.add_vms(VmKind::Function, self.config.scale_increase).await;
            self.grace_start = Some(Instant::now());
        }

        // A thread this hot is dominated by whatever it hosts; replicate
        // those functions onto other threads before the next epoch.
        let pool = ExecutorPool::Unified(executor_statuses.keys().cloned().collect());
        let hot: Vec<(ExecutorKey, Vec<String>)> = executor_statuses
            .values()
            .filter(|status| status.utilization > self.config.hotspot_utilization)
            .map(|status| (status.key(), status.functions.clone()))
            .collect();
        for (key, functions) in hot {
            info!(executor = %key, "thread exceeds hotspot utilization, replicating its functions");
            for fname in functions {
                scaler.replicate_function(&fname, 2, &mut self.function_locations, &pool).await;
            }
        }

        if avg_utilization < self.config.min_utilization
            && num_nodes > self.config.min_executor_nodes as f64
        {
            let victim_ip = executor_statuses
                .values()
                .choose(&mut rand::thread_rng())
                .map(|status| status.ip.clone());
            if let Some(ip) = victim_ip {
                info!(
                    avg_utilization,
                    threads = thread_count,
                    node = %ip,
                    "average load under threshold, retiring an executor node"
                );
                for tid in 0..self.executor_threads {
                    scaler.depart_executor(&ip, tid).await;
                    executor_statuses.remove(&ExecutorKey::new(ip.clone(), tid));
                }
                departing_executors.insert(ip, self.executor_threads);
                self.grace_start = Some(Instant::now());
            }
        }
    }
}
