//! Static transport topology.
//!
//! Peer endpoints and process groups are declared in configuration and resolved
//! once at startup. Every logical link gets a device-capable group and a
//! host-memory group over the same ranks; KV traffic travels on the host group
//! of the link group.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transfer::TransportError;

/// Traffic tag shared by both ends of the KV link.
pub const DEFAULT_TRANSPORT_TAG: u32 = 24_857_323;

/// Where a process group's collectives run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBackend {
    /// Accelerator memory.
    Device,
    /// Host memory.
    Host,
}

impl fmt::Display for GroupBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBackend::Device => write!(f, "device"),
            GroupBackend::Host => write!(f, "host"),
        }
    }
}

/// Network address of one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub rank: usize,
    /// `host:port` the rank listens on.
    pub addr: String,
}

/// A named set of ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub ranks: Vec<usize>,
}

/// Transport section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Traffic tag; frames with another tag are rejected.
    pub tag: u32,

    /// This process's rank.
    pub rank: usize,

    /// Number of ranks in the world.
    pub world_size: usize,

    /// Rank this process sends to.
    pub send_peer: usize,

    /// Rank this process receives from.
    pub recv_peer: usize,

    /// Listen addresses of all ranks we talk to (including ourselves).
    pub endpoints: Vec<EndpointConfig>,

    /// Process groups; `link_group` must be one of them. Others (tensor- or
    /// pipeline-parallel sub-groups) are resolved but carry no KV traffic.
    pub groups: Vec<GroupConfig>,

    /// Group whose host backend carries the KV link.
    pub link_group: String,

    /// Connection attempts before giving up on a peer.
    pub connect_retries: u32,

    /// Delay between connection attempts in milliseconds.
    pub connect_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tag: DEFAULT_TRANSPORT_TAG,
            rank: 1,
            world_size: 2,
            send_peer: 0,
            recv_peer: 0,
            endpoints: vec![
                EndpointConfig {
                    rank: 0,
                    addr: "127.0.0.1:29500".to_string(),
                },
                EndpointConfig {
                    rank: 1,
                    addr: "127.0.0.1:29501".to_string(),
                },
            ],
            groups: vec![GroupConfig {
                name: "world".to_string(),
                ranks: vec![0, 1],
            }],
            link_group: "world".to_string(),
            connect_retries: 60,
            connect_backoff_ms: 500,
        }
    }
}

/// A resolved process group on one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub name: String,
    pub backend: GroupBackend,
    pub ranks: Vec<usize>,
}

impl ProcessGroup {
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }
}

/// Device and host groups over the same ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPair {
    pub device: ProcessGroup,
    pub host: ProcessGroup,
}

impl GroupPair {
    fn new(config: &GroupConfig) -> Self {
        let mut ranks = config.ranks.clone();
        ranks.sort_unstable();
        let group = |backend| ProcessGroup {
            name: config.name.clone(),
            backend,
            ranks: ranks.clone(),
        };
        Self {
            device: group(GroupBackend::Device),
            host: group(GroupBackend::Host),
        }
    }
}

/// A peer rank and its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub rank: usize,
    pub addr: String,
}

/// Topology resolved from [`TransportConfig`].
#[derive(Debug, Clone)]
pub struct Topology {
    pub tag: u32,
    pub rank: usize,
    pub world_size: usize,
    /// Our own listen address.
    pub listen_addr: String,
    pub send_peer: Peer,
    pub recv_peer: Peer,
    /// Groups carrying the KV link.
    pub link: GroupPair,
    /// All other declared groups.
    pub sub_groups: HashMap<String, GroupPair>,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
}

impl Topology {
    /// Validate the configuration and resolve peers and groups.
    pub fn resolve(config: &TransportConfig) -> Result<Self, TransportError> {
        let invalid = |msg: String| Err(TransportError::Topology(msg));

        if config.world_size < 2 {
            return invalid(format!("world size {} leaves no peer", config.world_size));
        }
        for (what, rank) in [
            ("rank", config.rank),
            ("send peer", config.send_peer),
            ("recv peer", config.recv_peer),
        ] {
            if rank >= config.world_size {
                return invalid(format!(
                    "{what} {rank} outside world of size {}",
                    config.world_size
                ));
            }
        }
        if config.send_peer == config.rank || config.recv_peer == config.rank {
            return invalid(format!("rank {} cannot link to itself", config.rank));
        }

        let mut addrs = HashMap::new();
        for endpoint in &config.endpoints {
            if endpoint.rank >= config.world_size {
                return invalid(format!("endpoint for unknown rank {}", endpoint.rank));
            }
            if addrs.insert(endpoint.rank, endpoint.addr.clone()).is_some() {
                return invalid(format!("duplicate endpoint for rank {}", endpoint.rank));
            }
        }
        let addr_of = |rank: usize| {
            addrs
                .get(&rank)
                .cloned()
                .ok_or_else(|| TransportError::Topology(format!("no endpoint for rank {rank}")))
        };

        let mut link = None;
        let mut sub_groups = HashMap::new();
        let mut seen = HashSet::new();
        for group in &config.groups {
            if !seen.insert(group.name.as_str()) {
                return invalid(format!("duplicate group {:?}", group.name));
            }
            if let Some(rank) = group.ranks.iter().find(|&&r| r >= config.world_size) {
                return invalid(format!("group {:?} names unknown rank {rank}", group.name));
            }
            let pair = GroupPair::new(group);
            if group.name == config.link_group {
                link = Some(pair);
            } else {
                sub_groups.insert(group.name.clone(), pair);
            }
        }

        let Some(link) = link else {
            return invalid(format!("link group {:?} is not declared", config.link_group));
        };
        for rank in [config.rank, config.send_peer, config.recv_peer] {
            if !link.host.contains(rank) {
                return invalid(format!(
                    "rank {rank} is not a member of link group {:?}",
                    config.link_group
                ));
            }
        }

        Ok(Self {
            tag: config.tag,
            rank: config.rank,
            world_size: config.world_size,
            listen_addr: addr_of(config.rank)?,
            send_peer: Peer {
                rank: config.send_peer,
                addr: addr_of(config.send_peer)?,
            },
            recv_peer: Peer {
                rank: config.recv_peer,
                addr: addr_of(config.recv_peer)?,
            },
            link,
            sub_groups,
            connect_retries: config.connect_retries,
            connect_backoff_ms: config.connect_backoff_ms,
        })
    }

    /// Whether one peer handles both directions.
    pub fn is_symmetric(&self) -> bool {
        self.send_peer.rank == self.recv_peer.rank
    }

    /// Distinct peers, send peer first.
    pub fn peers(&self) -> Vec<&Peer> {
        if self.is_symmetric() {
            vec![&self.send_peer]
        } else {
            vec![&self.send_peer, &self.recv_peer]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolves() {
        let topo = Topology::resolve(&TransportConfig::default()).unwrap();
        assert_eq!(topo.rank, 1);
        assert_eq!(topo.listen_addr, "127.0.0.1:29501");
        assert_eq!(topo.send_peer.addr, "127.0.0.1:29500");
        assert!(topo.is_symmetric());
        assert_eq!(topo.link.device.backend, GroupBackend::Device);
        assert_eq!(topo.link.host.backend, GroupBackend::Host);
        assert_eq!(topo.link.host.ranks, vec![0, 1]);
    }

    #[test]
    fn test_sub_groups_resolved() {
        let mut config = TransportConfig::default();
        config.groups.push(GroupConfig {
            name: "tp".to_string(),
            ranks: vec![1],
        });
        let topo = Topology::resolve(&config).unwrap();
        assert!(topo.sub_groups["tp"].device.contains(1));
    }

    #[test]
    fn test_self_link_rejected() {
        let config = TransportConfig {
            send_peer: 1,
            ..Default::default()
        };
        assert!(matches!(
            Topology::resolve(&config),
            Err(TransportError::Topology(_))
        ));
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let mut config = TransportConfig::default();
        config.endpoints.retain(|e| e.rank != 0);
        assert!(Topology::resolve(&config).is_err());
    }

    #[test]
    fn test_link_membership_required() {
        let mut config = TransportConfig::default();
        config.groups[0].ranks = vec![1];
        assert!(Topology::resolve(&config).is_err());

        let config = TransportConfig {
            link_group: "pp".to_string(),
            ..Default::default()
        };
        assert!(Topology::resolve(&config).is_err());
    }
}
