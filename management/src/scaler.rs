// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Placement actuation: pinning and unpinning function replicas on executor
//! threads, and VM churn commands to the co-located provisioning worker.

use crate::{
    counters,
    network::{address::AddressMap, SocketCache},
};
use async_trait::async_trait;
use bytes::Bytes;
use cascade_types::{ExecutorKey, GenericResponse, PinFunction};
use prost::Message;
use rand::{seq::IteratorRandom, Rng};
use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{info, warn};

/// Functions whose name carries this substring run on GPU executors.
const GPU_FUNCTION_TAG: &str = "gpu";

/// `dereplicate_function` never reduces a function below this many replicas,
/// whatever target it is asked for.
const DEREPLICATE_FLOOR: u64 = 2;

/// VM classes the provisioning worker knows how to add and remove.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmKind {
    Memory,
    Ebs,
    Function,
}

impl Display for VmKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let name = match self {
            VmKind::Memory => "memory",
            VmKind::Ebs => "ebs",
            VmKind::Function => "function",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
#[error("unknown vm kind: {0}")]
pub struct UnknownVmKind(pub String);

impl FromStr for VmKind {
    type Err = UnknownVmKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(VmKind::Memory),
            "ebs" => Ok(VmKind::Ebs),
            "function" => Ok(VmKind::Function),
            other => Err(UnknownVmKind(other.to_string())),
        }
    }
}

/// The executor threads a replicate call may draw candidates from: either one
/// undifferentiated set, or the CPU/GPU partition of the full status table.
/// GPU-tagged functions draw from the GPU side of a partition.
#[derive(Clone, Debug)]
pub enum ExecutorPool {
    Unified(HashSet<ExecutorKey>),
    Partitioned {
        cpu: HashSet<ExecutorKey>,
        gpu: HashSet<ExecutorKey>,
    },
}

impl ExecutorPool {
    fn set_for(&self, fname: &str) -> &HashSet<ExecutorKey> {
        match self {
            ExecutorPool::Unified(executors) => executors,
            ExecutorPool::Partitioned { cpu, gpu } => {
                if fname.contains(GPU_FUNCTION_TAG) {
                    gpu
                } else {
                    cpu
                }
            },
        }
    }
}

/// Candidate threads for a new replica of `fname`: the pool minus the
/// function's existing replicas, and for GPU functions minus every thread
/// already hosting any GPU function (one GPU function per thread).
fn placement_candidates(
    fname: &str,
    function_locations: &HashMap<String, HashSet<ExecutorKey>>,
    pool: &ExecutorPool,
) -> Vec<ExecutorKey> {
    let existing = function_locations.get(fname);
    let excluded: HashSet<&ExecutorKey> = if fname.contains(GPU_FUNCTION_TAG) {
        function_locations
            .iter()
            .filter(|(name, _)| name.contains(GPU_FUNCTION_TAG))
            .flat_map(|(_, keys)| keys.iter())
            .collect()
    } else {
        existing.into_iter().flat_map(|keys| keys.iter()).collect()
    };

    pool.set_for(fname)
        .iter()
        .filter(|key| !excluded.contains(key))
        .cloned()
        .collect()
}

#[async_trait]
pub trait Scaler: Send {
    /// Pins up to `num_replicas` new copies of `fname` onto threads drawn
    /// uniformly at random from `pool`, recording each acknowledged placement
    /// in `function_locations`. Candidates that time out or refuse do not
    /// count; the call stops silently when candidates run out.
    async fn replicate_function(
        &mut self,
        fname: &str,
        num_replicas: u64,
        function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
        pool: &ExecutorPool,
    );

    /// Unpins random replicas of `fname` until at most `target_replicas`
    /// remain. Targets below the floor are ignored.
    async fn dereplicate_function(
        &mut self,
        fname: &str,
        target_replicas: u64,
        function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
    );

    async fn add_vms(&mut self, kind: VmKind, count: u32);

    async fn remove_vms(&mut self, kind: VmKind, ip: &str);

    /// Tells one executor thread to drain and leave the cluster.
    async fn depart_executor(&mut self, ip: &str, tid: u32);
}

pub struct DefaultScaler {
    /// Address executors acknowledge pins to.
    self_ip: String,
    addresses: AddressMap,
    sockets: SocketCache,
    pin_acks: mpsc::Receiver<GenericResponse>,
    pin_ack_timeout: Duration,
}

impl DefaultScaler {
    pub fn new(
        self_ip: String,
        addresses: AddressMap,
        sockets: SocketCache,
        pin_acks: mpsc::Receiver<GenericResponse>,
        pin_ack_timeout: Duration,
    ) -> Self {
        Self {
            self_ip,
            addresses,
            sockets,
            pin_acks,
            pin_ack_timeout,
        }
    }
}

#[async_trait]
impl Scaler for DefaultScaler {
    async fn replicate_function(
        &mut self,
        fname: &str,
        num_replicas: u64,
        function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
        pool: &ExecutorPool,
    ) {
        let mut candidates = placement_candidates(fname, function_locations, pool);
        let mut placed = 0;

        while placed < num_replicas && !candidates.is_empty() {
            let index = rand::thread_rng().gen_range(0, candidates.len());
            let key = candidates.swap_remove(index);

            let pin = PinFunction {
                name: fname.to_string(),
                response_address: self.self_ip.clone(),
            };
            let address = self.addresses.executor_pin(&key.ip, key.tid);
            self.sockets.send(&address, Bytes::from(pin.encode_to_vec())).await;

            // Placement is strictly serialized: nothing else runs in the
            // controller until this ack arrives or the deadline passes.
            match timeout(self.pin_ack_timeout, self.pin_acks.recv()).await {
                Err(_) => {
                    warn!(
                        function = fname,
                        executor = %key,
                        "no pin acknowledgement within the deadline, dropping candidate"
                    );
                    counters::PIN_REQUESTS.with_label_values(&["timeout"]).inc();
                },
                Ok(None) => {
                    warn!("pin acknowledgement channel closed, abandoning replication");
                    return;
                },
                Ok(Some(ack)) => {
                    if ack.success {
                        info!(function = fname, executor = %key, "pinned function replica");
                        counters::PIN_REQUESTS.with_label_values(&["accepted"]).inc();
                        function_locations.entry(fname.to_string()).or_default().insert(key);
                        placed += 1;
                    } else {
                        info!(function = fname, executor = %key, "executor refused pin, dropping candidate");
                        counters::PIN_REQUESTS.with_label_values(&["refused"]).inc();
                    }
                },
            }
        }
    }

    async fn dereplicate_function(
        &mut self,
        fname: &str,
        target_replicas: u64,
        function_locations: &mut HashMap<String, HashSet<ExecutorKey>>,
    ) {
        if target_replicas < DEREPLICATE_FLOOR {
            return;
        }
        let locations = match function_locations.get_mut(fname) {
            Some(locations) => locations,
            None => return,
        };

        while locations.len() as u64 > target_replicas {
            let victim = match locations.iter().choose(&mut rand::thread_rng()).cloned() {
                Some(victim) => victim,
                None => return,
            };
            locations.remove(&victim);
            info!(function = fname, executor = %victim, "unpinning function replica");
            let address = self.addresses.executor_unpin(&victim.ip, victim.tid);
            self.sockets.send(&address, Bytes::from(fname.to_string())).await;
        }
    }

    async fn add_vms(&mut self, kind: VmKind, count: u32) {
        info!(%kind, count, "requesting additional vms");
        counters::VM_CHURN.with_label_values(&["add", &kind.to_string()]).inc();
        let message = format!("{kind}:{count}");
        self.sockets.send(self.addresses.node_add(), Bytes::from(message)).await;
    }

    async fn remove_vms(&mut self, kind: VmKind, ip: &str) {
        info!(%kind, node = %ip, "requesting vm removal");
        counters::VM_CHURN.with_label_values(&["remove", &kind.to_string()]).inc();
        let message = format!("{kind}:{ip}");
        self.sockets.send(self.addresses.node_remove(), Bytes::from(message)).await;
    }

    async fn depart_executor(&mut self, ip: &str, tid: u32) {
        let address = self.addresses.executor_depart(ip, tid);
        self.sockets.send(&address, Bytes::new()).await;
    }
}
