use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// The default number of ring positions given to each node.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

#[derive(Debug, Error, PartialEq, Eq)]
/// The node configuration cannot be used to start a node.
pub enum ConfigError {
    #[error("The node id must not be empty.")]
    EmptyNodeId,

    #[error("{0} must be greater than zero.")]
    Zero(&'static str),

    #[error("The direct probe timeout ({direct:?}) must be shorter than the total probe timeout ({total:?}).")]
    ProbeTimeouts { direct: Duration, total: Duration },

    #[error("The write quorum ({quorum}) cannot exceed the replication factor ({replication_factor}).")]
    QuorumTooLarge {
        quorum: usize,
        replication_factor: usize,
    },
}

#[derive(Debug, Clone)]
/// Timing and fan-out settings of the gossip membership protocol.
pub struct GossipConfig {
    /// The protocol period `T`, one peer is probed per period.
    pub gossip_interval: Duration,
    /// How long to wait for a direct ping to be acknowledged before
    /// asking other peers to probe the target.
    pub direct_probe_timeout: Duration,
    /// How long a probe may take in total, including indirect probes,
    /// before the target becomes suspect.
    pub probe_timeout: Duration,
    /// How long a suspect member has to refute the suspicion before it is
    /// declared dead.
    pub suspicion_timeout: Duration,
    /// How long dead members are remembered before being forgotten.
    pub dead_node_retention: Duration,
    /// The number of peers asked to probe an unresponsive target.
    pub indirect_probes: usize,
    /// The maximum number of membership records attached to a single message.
    pub max_piggyback: usize,
    /// Each membership change is sent `multiplier * ceil(log2(n + 1))` times.
    pub retransmit_multiplier: usize,
    /// How often seed nodes are contacted again while no peers are known.
    pub join_retry_interval: Duration,
    /// Tell live peers we are leaving when shutting down.
    ///
    /// When disabled a shutdown looks identical to a crash to the rest
    /// of the cluster.
    pub announce_leave: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            direct_probe_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(800),
            suspicion_timeout: Duration::from_secs(5),
            dead_node_retention: Duration::from_secs(60),
            indirect_probes: 3,
            max_piggyback: 8,
            retransmit_multiplier: 4,
            join_retry_interval: Duration::from_secs(5),
            announce_leave: true,
        }
    }
}

#[derive(Debug, Clone)]
/// Configuration of a single cache node.
pub struct NodeConfig {
    /// The unique id of the node within the cluster.
    pub node_id: String,

    /// The binding address for the RPC server to bind and listen on.
    ///
    /// This is often `0.0.0.0` + your chosen port.
    pub listen_addr: SocketAddr,

    /// The address broadcast to other cluster members.
    ///
    /// Defaults to the listen address.
    pub public_addr: Option<SocketAddr>,

    /// A set of initial seed nodes which the node will attempt to connect to and
    /// learn of any other members in the cluster.
    ///
    /// No seeds need to be live at startup, a node with no reachable seeds
    /// starts as a single node cluster and keeps retrying them.
    pub seed_nodes: Vec<String>,

    /// Membership protocol settings.
    pub gossip: GossipConfig,

    /// The number of distinct nodes that hold a copy of each key (`R`).
    pub replication_factor: usize,

    /// The number of owner acknowledgements a write needs (`W`).
    ///
    /// `None` requires every owner of the key.
    pub write_quorum: Option<usize>,

    /// The number of ring positions given to each node (`V`).
    pub virtual_nodes: usize,

    /// Query every owner on reads and repair any stale copies.
    pub read_repair: bool,

    /// The deadline of a single call to a peer.
    pub rpc_timeout: Duration,

    /// How many times a call for a client operation is attempted per peer.
    pub rpc_attempts: usize,

    /// Membership changes landing within this window are folded into
    /// a single ring rebuild.
    pub ring_rebuild_debounce: Duration,

    /// How often locally held entries that now belong to other nodes
    /// are handed over to them. `None` disables the hand over.
    pub reconcile_interval: Option<Duration>,

    /// The maximum number of entries held by the default in-memory store.
    pub store_capacity: usize,

    /// How often expired entries are removed from the local store.
    pub sweep_interval: Duration,
}

impl NodeConfig {
    /// Creates a new config with the default settings.
    pub fn new(node_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr,
            public_addr: None,
            seed_nodes: Vec::new(),
            gossip: GossipConfig::default(),
            replication_factor: 1,
            write_quorum: None,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            read_repair: false,
            rpc_timeout: Duration::from_secs(2),
            rpc_attempts: 2,
            ring_rebuild_debounce: Duration::from_millis(50),
            reconcile_interval: Some(Duration::from_secs(30)),
            store_capacity: 1_000_000,
            sweep_interval: Duration::from_secs(1),
        }
    }

    /// Set the public address broadcast to other members.
    pub fn with_public_addr(mut self, addr: SocketAddr) -> Self {
        self.public_addr = Some(addr);
        self
    }

    /// Set the seed nodes used to join the cluster.
    pub fn with_seed_nodes(
        mut self,
        seeds: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        self.seed_nodes = seeds
            .into_iter()
            .map(|seed| seed.as_ref().to_string())
            .collect();
        self
    }

    /// Set the gossip settings.
    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    /// Set the replication factor and write quorum.
    pub fn with_replication(
        mut self,
        replication_factor: usize,
        write_quorum: Option<usize>,
    ) -> Self {
        self.replication_factor = replication_factor;
        self.write_quorum = write_quorum;
        self
    }

    /// Enable or disable read repair.
    pub fn with_read_repair(mut self, enabled: bool) -> Self {
        self.read_repair = enabled;
        self
    }

    /// Set the number of virtual nodes per member.
    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes;
        self
    }

    /// Set the peer call deadline and the number of attempts per peer.
    pub fn with_rpc_timeout(mut self, timeout: Duration, attempts: usize) -> Self {
        self.rpc_timeout = timeout;
        self.rpc_attempts = attempts;
        self
    }

    /// Set or disable the reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Option<Duration>) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Checks the config can be used to start a node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }

        let non_zero = [
            ("gossip_interval", self.gossip.gossip_interval.is_zero()),
            ("direct_probe_timeout", self.gossip.direct_probe_timeout.is_zero()),
            ("suspicion_timeout", self.gossip.suspicion_timeout.is_zero()),
            ("join_retry_interval", self.gossip.join_retry_interval.is_zero()),
            ("max_piggyback", self.gossip.max_piggyback == 0),
            ("retransmit_multiplier", self.gossip.retransmit_multiplier == 0),
            ("replication_factor", self.replication_factor == 0),
            ("virtual_nodes", self.virtual_nodes == 0),
            ("rpc_timeout", self.rpc_timeout.is_zero()),
            ("rpc_attempts", self.rpc_attempts == 0),
            ("store_capacity", self.store_capacity == 0),
            ("sweep_interval", self.sweep_interval.is_zero()),
            ("write_quorum", self.write_quorum == Some(0)),
            (
                "reconcile_interval",
                self.reconcile_interval.map_or(false, |i| i.is_zero()),
            ),
        ];

        if let Some((name, _)) = non_zero.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero(name));
        }

        if self.gossip.direct_probe_timeout >= self.gossip.probe_timeout {
            return Err(ConfigError::ProbeTimeouts {
                direct: self.gossip.direct_probe_timeout,
                total: self.gossip.probe_timeout,
            });
        }

        if let Some(quorum) = self.write_quorum {
            if quorum > self.replication_factor {
                return Err(ConfigError::QuorumTooLarge {
                    quorum,
                    replication_factor: self.replication_factor,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig::new("node-1", "127.0.0.1:8000".parse().unwrap())
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_configs() {
        let mut cfg = config();
        cfg.node_id = String::new();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyNodeId));

        let cfg = config().with_replication(0, None);
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("replication_factor")));

        let cfg = config().with_replication(2, Some(3));
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::QuorumTooLarge {
                quorum: 3,
                replication_factor: 2
            })
        );

        let cfg = config().with_gossip(GossipConfig {
            direct_probe_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ProbeTimeouts { .. })
        ));

        let cfg = config().with_virtual_nodes(0);
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("virtual_nodes")));
    }
}
