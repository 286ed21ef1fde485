// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! The controller event loop: binds the inbound channels, aggregates epoch
//! statistics, and drives hash-ring reconciliation and the policies once per
//! report period.

use crate::{
    counters,
    hash_ring,
    network::{self, address::AddressMap, NetworkError, SocketCache},
    orchestrator::{roles, Orchestrator},
    policy::Policy,
    scaler::{Scaler, VmKind},
};
use bytes::{Bytes, BytesMut};
use cascade_config::{ManagementConfig, NetworkConfig};
use cascade_types::{ExecutorKey, ExecutorStatistics, GenericResponse, StringSet, ThreadStatus};
use prost::Message;
use std::{collections::HashMap, time::Instant};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{info, warn};

/// One inbound event, decoded off whichever channel it arrived on.
/// Request/reply channels carry their reply sender with them.
pub enum Inbound {
    /// `add:<count>:<kind>` or `remove:<ip>:<kind>`.
    Churn(String),
    /// Pod IP whose restart count the requester wants.
    Restart {
        raw: String,
        reply: oneshot::Sender<Bytes>,
    },
    /// Endpoint to push the executor IP list to.
    ListExecutors { response_address: String },
    ListSchedulers { reply: oneshot::Sender<Bytes> },
    /// One executor thread acknowledging a departure request.
    ExecutorDepart(String),
    Statistics(ExecutorStatistics),
}

fn utf8(bytes: BytesMut) -> Option<String> {
    String::from_utf8(bytes.to_vec()).ok()
}

fn decode_churn(bytes: BytesMut) -> Option<Inbound> {
    Some(Inbound::Churn(utf8(bytes)?))
}

fn decode_restart(bytes: BytesMut, reply: oneshot::Sender<Bytes>) -> Option<Inbound> {
    Some(Inbound::Restart {
        raw: utf8(bytes)?,
        reply,
    })
}

fn decode_list_executors(bytes: BytesMut) -> Option<Inbound> {
    Some(Inbound::ListExecutors {
        response_address: utf8(bytes)?,
    })
}

fn decode_list_schedulers(_bytes: BytesMut, reply: oneshot::Sender<Bytes>) -> Option<Inbound> {
    // The request body carries nothing; the reply does not depend on it.
    Some(Inbound::ListSchedulers { reply })
}

fn decode_executor_depart(bytes: BytesMut) -> Option<Inbound> {
    Some(Inbound::ExecutorDepart(utf8(bytes)?))
}

fn decode_statistics(bytes: BytesMut) -> Option<Inbound> {
    Some(Inbound::Statistics(ExecutorStatistics::decode(bytes).ok()?))
}

fn decode_thread_status(bytes: BytesMut) -> Option<ThreadStatus> {
    ThreadStatus::decode(bytes).ok()
}

fn decode_pin_ack(bytes: BytesMut) -> Option<GenericResponse> {
    GenericResponse::decode(bytes).ok()
}

/// Receivers handed to the controller after the listeners are bound. The
/// pin-acknowledgement receiver goes to the scaler; the rest feed the loop.
pub struct InboundChannels {
    pub events: mpsc::Receiver<Inbound>,
    pub statuses: mpsc::Receiver<ThreadStatus>,
    pub pin_acks: mpsc::Receiver<GenericResponse>,
}

/// Binds every inbound endpoint and spawns the listener tasks feeding the
/// returned channels. Called once, after the startup prerequisites exist.
pub async fn spawn_listeners(config: &NetworkConfig) -> Result<InboundChannels, NetworkError> {
    let (events_tx, events) = mpsc::channel(config.inbound_queue_depth);
    let (status_tx, statuses) = mpsc::channel(config.inbound_queue_depth);
    let (ack_tx, pin_acks) = mpsc::channel(config.inbound_queue_depth);

    let restart = TcpListener::bind(("0.0.0.0", config.restart_port)).await?;
    let churn = TcpListener::bind(("0.0.0.0", config.churn_port)).await?;
    let list_executors = TcpListener::bind(("0.0.0.0", config.list_executors_port)).await?;
    let function_status = TcpListener::bind(("0.0.0.0", config.function_status_port)).await?;
    let list_schedulers = TcpListener::bind(("0.0.0.0", config.list_schedulers_port)).await?;
    let executor_depart = TcpListener::bind(("0.0.0.0", config.executor_depart_port)).await?;
    let statistics = TcpListener::bind(("0.0.0.0", config.statistics_port)).await?;
    let pin_accept = TcpListener::bind(("0.0.0.0", config.pin_accept_port)).await?;

    network::spawn_reply_listener("restart", restart, events_tx.clone(), decode_restart);
    network::spawn_pull_listener("churn", churn, events_tx.clone(), decode_churn);
    network::spawn_pull_listener(
        "list-executors",
        list_executors,
        events_tx.clone(),
        decode_list_executors,
    );
    network::spawn_pull_listener("function-status", function_status, status_tx, decode_thread_status);
    network::spawn_reply_listener(
        "list-schedulers",
        list_schedulers,
        events_tx.clone(),
        decode_list_schedulers,
    );
    network::spawn_pull_listener(
        "executor-depart",
        executor_depart,
        events_tx.clone(),
        decode_executor_depart,
    );
    network::spawn_pull_listener("statistics", statistics, events_tx, decode_statistics);
    network::spawn_pull_listener("pin-accept", pin_accept, ack_tx, decode_pin_ack);

    Ok(InboundChannels {
        events,
        statuses,
        pin_acks,
    })
}

/// Statistics aggregated over one report period.
#[derive(Debug, Default)]
pub struct EpochStats {
    /// Calls observed without runtime samples, per function.
    pub function_frequencies: HashMap<String, u64>,
    /// Total runtime and completed-call count, per function.
    pub function_runtimes: HashMap<String, (f64, u64)>,
    /// Calls per DAG. Never cleared: accumulates for the process lifetime.
    pub dag_frequencies: HashMap<String, u64>,
    /// End-to-end request runtimes per DAG.
    pub dag_runtimes: HashMap<String, Vec<f64>>,
    /// Request interarrival gaps per DAG.
    pub arrival_times: HashMap<String, Vec<f64>>,
}

impl EpochStats {
    /// Folds one statistics report into the epoch tables. Every reporting
    /// function gets entries in both per-function tables so the policy can
    /// iterate one and index the other.
    pub fn absorb(&mut self, stats: ExecutorStatistics) {
        for fstats in stats.functions {
            let frequency = self.function_frequencies.entry(fstats.name.clone()).or_insert(0);
            let runtime = self.function_runtimes.entry(fstats.name).or_insert((0.0, 0));
            if !fstats.runtime.is_empty() {
                runtime.0 += fstats.runtime.iter().sum::<f64>();
                runtime.1 += fstats.call_count;
            } else {
                *frequency += fstats.call_count;
            }
        }

        for dstats in stats.dags {
            self.arrival_times
                .entry(dstats.name.clone())
                .or_default()
                .extend(dstats.interarrival);
            *self.dag_frequencies.entry(dstats.name.clone()).or_insert(0) += dstats.call_count;
            self.dag_runtimes.entry(dstats.name).or_default().extend(dstats.runtimes);
        }
    }

    /// Clears the per-epoch tables after a policy cycle. DAG call totals
    /// survive.
    pub fn clear_epoch(&mut self) {
        self.function_runtimes.clear();
        self.function_frequencies.clear();
        self.dag_runtimes.clear();
        self.arrival_times.clear();
    }
}

pub struct ManagementServer<O, S, P> {
    config: ManagementConfig,
    addresses: AddressMap,
    sockets: SocketCache,
    orchestrator: O,
    scaler: S,
    policy: P,
    /// Latest self-reported status per executor thread.
    statuses: HashMap<ExecutorKey, ThreadStatus>,
    /// Nodes told to depart, with the count of thread acks still outstanding.
    departing_executors: HashMap<String, u32>,
    epoch: EpochStats,
}

impl<O, S, P> ManagementServer<O, S, P>
where
    O: Orchestrator,
    S: Scaler,
    P: Policy<S>,
{
    pub fn new(config: ManagementConfig, orchestrator: O, scaler: S, policy: P) -> Self {
        let addresses = AddressMap::new(&config.network);
        let sockets = SocketCache::new(config.network.connection_cache_capacity);
        Self {
            config,
            addresses,
            sockets,
            orchestrator,
            scaler,
            policy,
            statuses: HashMap::new(),
            departing_executors: HashMap::new(),
            epoch: EpochStats::default(),
        }
    }

    /// Runs the controller loop forever. One handler runs to completion per
    /// event; thread statuses are additionally drained without blocking every
    /// iteration so a stalled pin cannot starve them.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Inbound>,
        mut statuses: mpsc::Receiver<ThreadStatus>,
    ) {
        let mut poll = interval(Duration::from_secs(1));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut epoch_start = Instant::now();

        info!("management controller entering its event loop");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("all inbound listeners stopped, shutting down");
                        return;
                    },
                },
                Some(status) = statuses.recv() => self.handle_status(status),
                _ = poll.tick() => {},
            }

            while let Ok(status) = statuses.try_recv() {
                self.handle_status(status);
            }

            if epoch_start.elapsed() > self.config.report_period() {
                self.run_epoch().await;
                epoch_start = Instant::now();
            }
        }
    }

    async fn handle_event(&mut self, event: Inbound) {
        match event {
            Inbound::Churn(message) => self.handle_churn(&message).await,
            Inbound::Restart { raw, reply } => {
                let pod_ip = raw.rsplit(':').next().unwrap_or("");
                let count = match self.orchestrator.restart_count(pod_ip).await {
                    Ok(count) => count.to_string(),
                    Err(err) => {
                        warn!(pod_ip, "failed to read restart count: {err}");
                        "0".to_string()
                    },
                };
                let _ = reply.send(Bytes::from(count));
            },
            Inbound::ListExecutors { response_address } => {
                let mut keys = Vec::new();
                for role in [roles::FUNCTION, roles::GPU] {
                    match self.orchestrator.pod_ips(role, false).await {
                        Ok(ips) => keys.extend(ips),
                        Err(err) => warn!(role, "failed to list executor pods: {err}"),
                    }
                }
                let payload = StringSet { keys }.encode_to_vec();
                self.sockets.send(&response_address, Bytes::from(payload)).await;
            },
            Inbound::ListSchedulers { reply } => {
                let keys = match self.orchestrator.pod_ips(roles::SCHEDULER, false).await {
                    Ok(ips) => ips,
                    Err(err) => {
                        warn!("failed to list scheduler pods: {err}");
                        Vec::new()
                    },
                };
                let _ = reply.send(Bytes::from(StringSet { keys }.encode_to_vec()));
            },
            Inbound::ExecutorDepart(ip) => self.handle_executor_depart(ip).await,
            Inbound::Statistics(stats) => self.epoch.absorb(stats),
        }
    }

    async fn handle_churn(&mut self, message: &str) {
        let parts: Vec<&str> = message.split(':').collect();
        match parts.as_slice() {
            ["add", count, kind] => match (count.parse::<u32>(), kind.parse::<VmKind>()) {
                (Ok(count), Ok(kind)) => self.scaler.add_vms(kind, count).await,
                _ => warn!(request = message, "malformed add request on the churn channel"),
            },
            ["remove", ip, kind] => match kind.parse::<VmKind>() {
                Ok(kind) => self.scaler.remove_vms(kind, ip).await,
                Err(_) => warn!(request = message, "malformed remove request on the churn channel"),
            },
            _ => warn!(request = message, "unrecognized churn request"),
        }
    }

    fn handle_status(&mut self, status: ThreadStatus) {
        // A departing node may still have reports in flight; recording them
        // would skew utilization downward.
        if self.departing_executors.contains_key(&status.ip) {
            return;
        }
        counters::STATUS_UPDATES.inc();
        info!(
            ip = %status.ip,
            tid = status.tid,
            utilization = status.utilization,
            pinned = status.functions.len(),
            "thread status update"
        );
        self.statuses.insert(status.key(), status);
    }

    async fn handle_executor_depart(&mut self, ip: String) {
        match self.departing_executors.get_mut(&ip) {
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    info!(node = %ip, "all threads acknowledged departure, removing node");
                    self.departing_executors.remove(&ip);
                    self.scaler.remove_vms(VmKind::Function, &ip).await;
                }
            },
            None => warn!(node = %ip, "departure ack from a node that was not departing"),
        }
    }

    async fn run_epoch(&mut self) {
        info!("checking hash ring");
        if let Err(err) = hash_ring::check_hash_ring(
            &self.orchestrator,
            &self.addresses,
            &mut self.sockets,
            &self.config.cluster,
        )
        .await
        {
            warn!("hash ring reconciliation failed: {err}");
        }

        self.policy
            .replica_policy(
                &mut self.scaler,
                &self.epoch.function_frequencies,
                &self.epoch.function_runtimes,
                &self.epoch.dag_runtimes,
                &self.statuses,
                &self.epoch.arrival_times,
            )
            .await;
        self.policy
            .executor_policy(&mut self.scaler, &mut self.statuses, &mut self.departing_executors)
            .await;

        self.epoch.clear_epoch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        orchestrator::OrchestratorError,
        policy::DefaultPolicy,
        scaler::ExecutorPool,
    };
    use async_trait::async_trait;
    use cascade_types::{DagStatistics, ExecutorType, FunctionStatistics};
    use std::collections::HashSet;

    #[derive(Debug, PartialEq)]
    enum Call {
        AddVms { kind: VmKind, count: u32 },
        RemoveVms { kind: VmKind, ip: String },
    }

    #[derive(Default)]
    struct MockScaler {
        calls: Vec<Call>,
    }

    #[async_trait]
    impl Scaler for MockScaler {
        async fn replicate_function(
            &mut self,
            _fname: &str,
            _num_replicas: u64,
            _function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
            _pool: &ExecutorPool,
        ) {
        }

        async fn dereplicate_function(
            &mut self,
            _fname: &str,
            _target_replicas: u64,
            _function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
        ) {
        }

        async fn add_vms(&mut self, kind: VmKind, count: u32) {
            self.calls.push(Call::AddVms { kind, count });
        }

        async fn remove_vms(&mut self, kind: VmKind, ip: &str) {
            self.calls.push(Call::RemoveVms {
                kind,
                ip: ip.to_string(),
            });
        }

        async fn depart_executor(&mut self, _ip: &str, _tid: u32) {}
    }

    #[derive(Default)]
    struct MockOrchestrator {
        ips: HashMap<String, Vec<String>>,
        restarts: HashMap<String, i32>,
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn pod_ips(
            &self,
            role: &str,
            _running_only: bool,
        ) -> Result<Vec<String>, OrchestratorError> {
            Ok(self.ips.get(role).cloned().unwrap_or_default())
        }

        async fn restart_count(&self, pod_ip: &str) -> Result<i32, OrchestratorError> {
            self.restarts
                .get(pod_ip)
                .copied()
                .ok_or_else(|| OrchestratorError::PodNotFound(pod_ip.to_string()))
        }
    }

    fn test_server(
        orchestrator: MockOrchestrator,
    ) -> ManagementServer<MockOrchestrator, MockScaler, DefaultPolicy> {
        let config = ManagementConfig::default();
        let executor_threads = config.cluster.executor_threads;
        ManagementServer::new(
            config,
            orchestrator,
            MockScaler::default(),
            DefaultPolicy::new(Default::default(), executor_threads),
        )
    }

    fn thread_status(ip: &str, tid: u32) -> ThreadStatus {
        ThreadStatus {
            ip: ip.to_string(),
            tid,
            utilization: 0.5,
            functions: vec!["f".to_string()],
            executor_type: ExecutorType::Cpu as i32,
        }
    }

    fn function_report(name: &str, call_count: u64, runtime: Vec<f64>) -> ExecutorStatistics {
        ExecutorStatistics {
            functions: vec![FunctionStatistics {
                name: name.to_string(),
                call_count,
                runtime,
            }],
            dags: vec![],
        }
    }

    #[test]
    fn runtime_reports_and_frequency_reports_fold_separately() {
        let mut epoch = EpochStats::default();
        epoch.absorb(function_report("f", 3, vec![0.2, 0.3]));
        epoch.absorb(function_report("f", 7, vec![]));
        epoch.absorb(function_report("f", 2, vec![0.5]));

        assert_eq!(epoch.function_frequencies["f"], 7);
        let (total, count) = epoch.function_runtimes["f"];
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(count, 5);
    }

    #[test]
    fn every_reporting_function_appears_in_both_tables() {
        let mut epoch = EpochStats::default();
        epoch.absorb(function_report("runtime_only", 3, vec![0.2]));
        epoch.absorb(function_report("calls_only", 4, vec![]));

        assert_eq!(epoch.function_frequencies["runtime_only"], 0);
        assert_eq!(epoch.function_runtimes["calls_only"], (0.0, 0));
    }

    #[test]
    fn dag_reports_extend_all_three_tables() {
        let mut epoch = EpochStats::default();
        let stats = ExecutorStatistics {
            functions: vec![],
            dags: vec![DagStatistics {
                name: "pipeline".to_string(),
                call_count: 4,
                interarrival: vec![0.1, 0.2],
                runtimes: vec![1.5],
            }],
        };
        epoch.absorb(stats.clone());
        epoch.absorb(stats);

        assert_eq!(epoch.dag_frequencies["pipeline"], 8);
        assert_eq!(epoch.arrival_times["pipeline"].len(), 4);
        assert_eq!(epoch.dag_runtimes["pipeline"].len(), 2);
    }

    #[test]
    fn clearing_an_epoch_keeps_dag_call_totals() {
        let mut epoch = EpochStats::default();
        epoch.absorb(function_report("f", 5, vec![0.1]));
        epoch.absorb(ExecutorStatistics {
            functions: vec![],
            dags: vec![DagStatistics {
                name: "pipeline".to_string(),
                call_count: 2,
                interarrival: vec![0.3],
                runtimes: vec![0.9],
            }],
        });

        epoch.clear_epoch();

        assert!(epoch.function_frequencies.is_empty());
        assert!(epoch.function_runtimes.is_empty());
        assert!(epoch.dag_runtimes.is_empty());
        assert!(epoch.arrival_times.is_empty());
        assert_eq!(epoch.dag_frequencies["pipeline"], 2);
    }

    #[test]
    fn statuses_from_departing_nodes_are_dropped() {
        let mut server = test_server(MockOrchestrator::default());
        server.departing_executors.insert("10.0.0.1".to_string(), 3);

        server.handle_status(thread_status("10.0.0.1", 0));
        assert!(server.statuses.is_empty());

        server.handle_status(thread_status("10.0.0.2", 0));
        assert_eq!(server.statuses.len(), 1);
    }

    #[test]
    fn later_status_for_a_key_wins() {
        let mut server = test_server(MockOrchestrator::default());
        server.handle_status(thread_status("10.0.0.1", 0));
        let mut update = thread_status("10.0.0.1", 0);
        update.utilization = 0.9;
        server.handle_status(update);

        let key = ExecutorKey::new("10.0.0.1", 0);
        assert_eq!(server.statuses.len(), 1);
        assert!((server.statuses[&key].utilization - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn final_depart_ack_removes_the_vm() {
        let mut server = test_server(MockOrchestrator::default());
        server.departing_executors.insert("10.0.0.1".to_string(), 3);

        for _ in 0..2 {
            server.handle_executor_depart("10.0.0.1".to_string()).await;
            assert!(server.scaler.calls.is_empty());
        }
        server.handle_executor_depart("10.0.0.1".to_string()).await;

        assert!(server.departing_executors.is_empty());
        assert_eq!(server.scaler.calls, vec![Call::RemoveVms {
            kind: VmKind::Function,
            ip: "10.0.0.1".to_string(),
        }]);
    }

    #[tokio::test]
    async fn unexpected_depart_ack_is_ignored() {
        let mut server = test_server(MockOrchestrator::default());
        server.handle_executor_depart("10.0.0.9".to_string()).await;
        assert!(server.scaler.calls.is_empty());
        assert!(server.departing_executors.is_empty());
    }

    #[tokio::test]
    async fn churn_requests_reach_the_scaler() {
        let mut server = test_server(MockOrchestrator::default());
        server.handle_churn("add:4:function").await;
        server.handle_churn("remove:10.0.0.3:memory").await;
        server.handle_churn("resize:2:function").await;

        assert_eq!(server.scaler.calls, vec![
            Call::AddVms {
                kind: VmKind::Function,
                count: 4,
            },
            Call::RemoveVms {
                kind: VmKind::Memory,
                ip: "10.0.0.3".to_string(),
            },
        ]);
    }

    #[tokio::test]
    async fn restart_requests_reply_with_the_pod_count() {
        let orchestrator = MockOrchestrator {
            restarts: HashMap::from([("10.0.0.4".to_string(), 7)]),
            ..Default::default()
        };
        let mut server = test_server(orchestrator);

        let (reply, rx) = oneshot::channel();
        server
            .handle_event(Inbound::Restart {
                raw: "restart:10.0.0.4".to_string(),
                reply,
            })
            .await;
        assert_eq!(&rx.await.unwrap()[..], b"7");

        let (reply, rx) = oneshot::channel();
        server
            .handle_event(Inbound::Restart {
                raw: "10.0.0.4".to_string(),
                reply,
            })
            .await;
        assert_eq!(&rx.await.unwrap()[..], b"7");
    }

    #[tokio::test]
    async fn scheduler_listing_replies_with_a_string_set() {
        let orchestrator = MockOrchestrator {
            ips: HashMap::from([(
                "scheduler".to_string(),
                vec!["10.0.1.1".to_string(), "10.0.1.2".to_string()],
            )]),
            ..Default::default()
        };
        let mut server = test_server(orchestrator);

        let (reply, rx) = oneshot::channel();
        server.handle_event(Inbound::ListSchedulers { reply }).await;
        let set = StringSet::decode(rx.await.unwrap()).unwrap();
        assert_eq!(set.keys, vec!["10.0.1.1", "10.0.1.2"]);
    }
}
