// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, ::prost::Enumeration)]
#[repr(i32)]
pub enum TierId {
    Memory = 0,
    Ebs = 1,
}

/// One storage node as recorded in the hash ring. Nodes are addressed by
/// private IP inside the cluster; the public IP is carried for operator
/// tooling and departure notices.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInfo {
    #[prost(string, tag = "1")]
    pub public_ip: String,
    #[prost(string, tag = "2")]
    pub private_ip: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tier {
    #[prost(enumeration = "TierId", tag = "1")]
    pub tier_id: i32,
    #[prost(message, repeated, tag = "2")]
    pub servers: Vec<ServerInfo>,
}

/// Snapshot of the cluster's hash-ring membership, served by the routing
/// tier's seed endpoint.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterMembership {
    #[prost(message, repeated, tag = "1")]
    pub tiers: Vec<Tier>,
}

impl ClusterMembership {
    /// Resolves which of the reported tiers is the memory tier and which the
    /// EBS tier. A single reported tier is always the memory tier; with two,
    /// assignment follows the tier id.
    pub fn memory_and_ebs_tiers(&self) -> (Option<&Tier>, Option<&Tier>) {
        match self.tiers.as_slice() {
            [] => (None, None),
            [only] => (Some(only), None),
            [first, second, ..] => {
                if first.tier_id() == TierId::Memory {
                    (Some(first), Some(second))
                } else {
                    (Some(second), Some(first))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(id: TierId, private_ips: &[&str]) -> Tier {
        Tier {
            tier_id: id as i32,
            servers: private_ips
                .iter()
                .map(|ip| ServerInfo {
                    public_ip: format!("pub-{ip}"),
                    private_ip: ip.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn no_tiers_resolves_to_nothing() {
        let membership = ClusterMembership { tiers: vec![] };
        assert_eq!(membership.memory_and_ebs_tiers(), (None, None));
    }

    #[test]
    fn single_tier_is_memory() {
        let membership = ClusterMembership {
            tiers: vec![tier(TierId::Ebs, &["10.0.0.1"])],
        };
        let (mem, ebs) = membership.memory_and_ebs_tiers();
        // Whatever the single tier claims to be, it is treated as memory.
        assert_eq!(mem.unwrap().servers[0].private_ip, "10.0.0.1");
        assert!(ebs.is_none());
    }

    #[test]
    fn two_tiers_resolve_by_id_in_either_order() {
        let membership = ClusterMembership {
            tiers: vec![tier(TierId::Ebs, &["10.0.0.2"]), tier(TierId::Memory, &["10.0.0.1"])],
        };
        let (mem, ebs) = membership.memory_and_ebs_tiers();
        assert_eq!(mem.unwrap().servers[0].private_ip, "10.0.0.1");
        assert_eq!(ebs.unwrap().servers[0].private_ip, "10.0.0.2");
    }
}
