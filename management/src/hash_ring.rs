// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation between the storage tiers' hash-ring membership and the
//! orchestrator's view of the world. Storage nodes that vanish without
//! announcing themselves (a crashed VM, a reclaimed spot instance) linger in
//! the ring until someone notices; the controller notices here, once per
//! epoch, and broadcasts their departure to every tier that routes by the
//! ring.

use crate::{
    counters,
    network::{self, address::AddressMap, NetworkError, SocketCache},
    orchestrator::{roles, Orchestrator, OrchestratorError},
};
use bytes::Bytes;
use cascade_config::ClusterConfig;
use cascade_types::{ClusterMembership, ServerInfo, TierId};
use prost::Message;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HashRingError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("membership request failed: {0}")]
    Network(#[from] NetworkError),
    #[error("malformed membership payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Compares the hash ring reported by the routing tier against the pods the
/// orchestrator actually knows, and broadcasts a departure notice for every
/// ring member that no longer exists.
pub async fn check_hash_ring<O: Orchestrator + ?Sized>(
    orchestrator: &O,
    addresses: &AddressMap,
    sockets: &mut SocketCache,
    cluster: &ClusterConfig,
) -> Result<(), HashRingError> {
    let route_ips = orchestrator.pod_ips(roles::ROUTING, false).await?;
    // No routing nodes means the cluster is still starting; nothing to check.
    if route_ips.is_empty() {
        return Ok(());
    }

    let seed_ip = match route_ips.choose(&mut rand::thread_rng()) {
        Some(ip) => ip.clone(),
        None => return Ok(()),
    };
    let reply = network::request(&addresses.routing_seed(&seed_ip, 0), Bytes::new()).await?;
    let membership = ClusterMembership::decode(reply)?;

    let (mem_tier, ebs_tier) = membership.memory_and_ebs_tiers();
    let mem_tier = match mem_tier {
        Some(tier) => tier,
        None => return Ok(()),
    };

    // Ring members the orchestrator no longer knows about have departed.
    let mem_ips = orchestrator.pod_ips(roles::MEMORY, false).await?;
    let mut departed: Vec<(TierId, ServerInfo)> = mem_tier
        .servers
        .iter()
        .filter(|server| !mem_ips.contains(&server.private_ip))
        .map(|server| (TierId::Memory, server.clone()))
        .collect();

    let mut ebs_ips = Vec::new();
    if let Some(ebs_tier) = ebs_tier {
        ebs_ips = orchestrator.pod_ips(roles::EBS, false).await?;
        departed.extend(
            ebs_tier
                .servers
                .iter()
                .filter(|server| !ebs_ips.contains(&server.private_ip))
                .map(|server| (TierId::Ebs, server.clone())),
        );
    }

    info!(count = departed.len(), "hash ring check found departed nodes");

    let mon_ips = orchestrator.pod_ips(roles::MONITORING, false).await?;
    let storage_ips: Vec<&String> = mem_ips.iter().chain(ebs_ips.iter()).collect();

    for (tier, node) in departed {
        info!(
            public_ip = %node.public_ip,
            private_ip = %node.private_ip,
            "informing the cluster of a departed node"
        );
        counters::STORAGE_NODES_DEPARTED.inc();

        let notice = format!("{}:{}:{}", tier as i32, node.public_ip, node.private_ip);

        for ip in &storage_ips {
            for tid in 0..cluster.storage_threads {
                sockets
                    .send(&addresses.storage_depart(ip, tid), Bytes::from(notice.clone()))
                    .await;
            }
        }

        let routing_notice = format!("depart:{notice}");
        for ip in &route_ips {
            for tid in 0..cluster.routing_threads {
                sockets
                    .send(&addresses.routing_notify(ip, tid), Bytes::from(routing_notice.clone()))
                    .await;
            }
        }

        for ip in &mon_ips {
            sockets.send(&addresses.monitoring_notify(ip), Bytes::from(notice.clone())).await;
        }
    }

    Ok(())
}
