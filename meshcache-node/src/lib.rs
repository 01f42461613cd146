//! A peer embedded distributed cache node.
//!
//! Every node runs the same code: a SWIM style gossip engine tracks which
//! peers are alive, a consistent hash ring built from the live members
//! decides which nodes own a key, and a router executes reads and writes
//! against those owners.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use meshcache_node::{CacheNodeBuilder, NodeConfig};
//!
//! # async fn run() -> Result<(), meshcache_node::NodeError> {
//! let config = NodeConfig::new("node-1", "127.0.0.1:8000".parse().unwrap())
//!     .with_seed_nodes(["127.0.0.1:8001"])
//!     .with_replication(2, None);
//!
//! let node = CacheNodeBuilder::new(config).start().await?;
//! node.set("hello", "world", Duration::from_secs(30)).await?;
//! assert_eq!(node.get("hello").await?, Some(b"world".to_vec()));
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod clock;
mod config;
mod error;
mod gossip;
mod membership;
mod ring;
mod router;
mod rpc;
mod statistics;
mod storage;
mod tasks;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use clock::{get_unix_timestamp_ms, Clock, ClockDrift, Version};
pub use config::{ConfigError, GossipConfig, NodeConfig, DEFAULT_VIRTUAL_NODES};
pub use error::NodeError;
use meshcache_rpc::Server;
pub use membership::{supersedes, Member, MembershipSnapshot, NodeRecord, NodeState};
pub use ring::{key_hash, HashRing, RingHandle, RingMember};
pub use statistics::ClusterStatistics;
pub use storage::{CacheEntry, LocalStore, MemStore};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;

use crate::gossip::{GossipEngine, GossipHandle};
use crate::router::{Router, RouterConfig};
use crate::rpc::network::RpcNetwork;
use crate::rpc::services::cache_impl::CacheService;
use crate::rpc::services::gossip_impl::GossipService;

/// The number of membership changes kept for subscribers which fall behind.
const MEMBERSHIP_CHANGE_BACKLOG: usize = 256;

/// Build a cache node using the provided settings.
pub struct CacheNodeBuilder<S = MemStore> {
    config: NodeConfig,
    store: Arc<S>,
}

impl CacheNodeBuilder<MemStore> {
    /// Create a new node builder using the default in-memory store.
    pub fn new(config: NodeConfig) -> Self {
        let store = Arc::new(MemStore::new(config.store_capacity));
        Self { config, store }
    }
}

impl<S> CacheNodeBuilder<S>
where
    S: LocalStore,
{
    /// Use a custom local store instead of the in-memory store.
    pub fn with_store<S2>(self, store: S2) -> CacheNodeBuilder<S2>
    where
        S2: LocalStore,
    {
        CacheNodeBuilder {
            config: self.config,
            store: Arc::new(store),
        }
    }

    /// Starts the node and begins joining the cluster through the seed nodes.
    ///
    /// The `node_id` **must be unique** within the cluster. None of the seed
    /// nodes need to be live when starting, the node keeps retrying them
    /// until it knows at least one live peer.
    pub async fn start(self) -> Result<CacheNode<S>, NodeError> {
        let cfg = self.config;
        cfg.validate()?;

        let statistics = ClusterStatistics::default();
        let network = RpcNetwork::default();
        let clock = Clock::new(&cfg.node_id);

        let rpc_server = Server::listen(cfg.listen_addr).await?;
        let public_addr = cfg.public_addr.unwrap_or_else(|| rpc_server.local_addr());

        let me = Member::new(cfg.node_id.clone(), public_addr, Instant::now());
        let (engine, gossip) = GossipEngine::new(
            cfg.gossip.clone(),
            me,
            cfg.seed_nodes.clone(),
            network.clone(),
            statistics.clone(),
        );
        rpc_server.add_service(GossipService::new(gossip.events()));

        let ring = RingHandle::new(HashRing::from_snapshot(
            &gossip.snapshot(),
            cfg.virtual_nodes,
            cfg.replication_factor,
        ));
        tokio::spawn(ring::run_ring_rebuilder(
            cfg.node_id.clone(),
            ring.clone(),
            gossip.subscribe(),
            cfg.virtual_nodes,
            cfg.replication_factor,
            cfg.ring_rebuild_debounce,
            statistics.clone(),
        ));

        rpc_server.add_service(CacheService::new(self.store.clone(), clock.clone()));
        let router = Router::new(
            cfg.node_id.clone(),
            self.store.clone(),
            ring.clone(),
            network.clone(),
            clock.clone(),
            RouterConfig {
                write_quorum: cfg.write_quorum,
                read_repair: cfg.read_repair,
                rpc_timeout: cfg.rpc_timeout,
                rpc_attempts: cfg.rpc_attempts,
            },
            statistics.clone(),
        );

        let (membership_changes, _) = broadcast::channel(MEMBERSHIP_CHANGE_BACKLOG);
        tokio::spawn(watch_membership_changes(
            cfg.node_id.clone(),
            network.clone(),
            gossip.subscribe(),
            membership_changes.clone(),
        ));

        let kill_switch = Arc::new(AtomicBool::new(false));
        tokio::spawn(tasks::expiry_sweeper_task(
            cfg.node_id.clone(),
            self.store.clone(),
            cfg.sweep_interval,
            kill_switch.clone(),
        ));
        if let Some(period) = cfg.reconcile_interval {
            tokio::spawn(tasks::handoff_task(
                cfg.node_id.clone(),
                router.clone(),
                period,
                kill_switch.clone(),
            ));
        }

        tokio::spawn(engine.run());

        info!(
            node_id = %cfg.node_id,
            listen_addr = %rpc_server.local_addr(),
            public_addr = %public_addr,
            num_seeds = cfg.seed_nodes.len(),
            replication_factor = cfg.replication_factor,
            "Cache node started."
        );

        Ok(CacheNode {
            node_id: cfg.node_id,
            public_addr,
            announce_leave: cfg.gossip.announce_leave,
            rpc_server,
            gossip,
            router,
            ring,
            clock,
            statistics,
            membership_changes,
            kill_switch,
        })
    }
}

/// A running cache node.
///
/// Dropping the node stops its background tasks without telling the rest
/// of the cluster, use [CacheNode::shutdown] to leave gracefully.
pub struct CacheNode<S = MemStore>
where
    S: LocalStore,
{
    node_id: String,
    public_addr: SocketAddr,
    announce_leave: bool,
    rpc_server: Server,
    gossip: GossipHandle,
    router: Router<S>,
    ring: RingHandle,
    clock: Clock,
    statistics: ClusterStatistics,
    membership_changes: broadcast::Sender<MembershipChange>,
    kill_switch: Arc<AtomicBool>,
}

impl<S> CacheNode<S>
where
    S: LocalStore,
{
    #[inline]
    /// The unique id of this node.
    pub fn me(&self) -> &str {
        &self.node_id
    }

    #[inline]
    /// The address other members use to reach this node.
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Retrieves the value of a key.
    ///
    /// Returns `None` if the key does not exist or has expired.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, NodeError> {
        self.router.get(key.as_ref()).await
    }

    /// Sets the value of a key, replacing any existing value.
    ///
    /// A zero `ttl` never expires, the entry can still be evicted once
    /// the store is full.
    pub async fn set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), NodeError> {
        self.router.set(key.into(), value.into(), ttl).await
    }

    /// Removes a key, removing a key which does not exist succeeds.
    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), NodeError> {
        self.router.delete(key.into()).await
    }

    #[inline]
    /// The current view of the cluster.
    pub fn membership(&self) -> Arc<MembershipSnapshot> {
        self.gossip.snapshot()
    }

    #[inline]
    /// Get a stream of members joining and leaving the cluster.
    ///
    /// Only changes made after subscribing are received. A subscriber
    /// which falls more than a few hundred changes behind receives a
    /// lag error in place of the changes it missed.
    pub fn membership_changes(&self) -> BroadcastStream<MembershipChange> {
        BroadcastStream::new(self.membership_changes.subscribe())
    }

    #[inline]
    /// The current hash ring.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load()
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.statistics.clone()
    }

    #[inline]
    /// Get access to the node's version clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Waits for the membership to satisfy the predicate.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_members<F>(&self, mut predicate: F, timeout_after: Duration) -> bool
    where
        F: FnMut(&MembershipSnapshot) -> bool,
    {
        let stream = WatchStream::new(self.gossip.subscribe())
            .skip_while(move |snapshot| !predicate(snapshot.as_ref()));
        tokio::pin!(stream);

        matches!(
            tokio::time::timeout(timeout_after, stream.next()).await,
            Ok(Some(_))
        )
    }

    /// Leaves the cluster and shuts the node down.
    ///
    /// When enabled the node first tells its live peers it is leaving.
    pub async fn shutdown(self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        self.gossip.shutdown(self.announce_leave).await;
        self.rpc_server.shutdown().await;

        info!(node_id = %self.node_id, "Cache node shut down.");
    }
}

impl<S> Drop for CacheNode<S>
where
    S: LocalStore,
{
    fn drop(&mut self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        self.gossip.shutdown_now();
    }
}

#[derive(Debug, Clone, Default)]
/// Members which joined or left the cluster since the last change.
pub struct MembershipChange {
    pub joined: Vec<Member>,
    pub left: Vec<Member>,
}

/// Watches for changes in the cluster membership.
///
/// Connections to members which left are dropped.
async fn watch_membership_changes(
    self_node_id: String,
    network: RpcNetwork,
    snapshots: watch::Receiver<Arc<MembershipSnapshot>>,
    membership_changes_tx: broadcast::Sender<MembershipChange>,
) {
    let mut last_members = BTreeMap::<(String, SocketAddr), Member>::new();
    let mut snapshots = WatchStream::new(snapshots);

    while let Some(snapshot) = snapshots.next().await {
        let members = snapshot
            .non_dead()
            .filter(|member| member.node_id != self_node_id)
            .map(|member| ((member.node_id.clone(), member.addr), member.clone()))
            .collect::<BTreeMap<_, _>>();

        let mut changes = MembershipChange::default();
        for (key, member) in last_members.iter() {
            if members.contains_key(key) {
                continue;
            }

            network.disconnect(member.addr);
            info!(
                self_node_id = %self_node_id,
                target_node_id = %member.node_id,
                target_addr = %member.addr,
                num_connections = network.len(),
                "Member is no longer part of the cluster."
            );
            changes.left.push(member.clone());
        }

        for (key, member) in members.iter() {
            if last_members.contains_key(key) {
                continue;
            }

            info!(
                self_node_id = %self_node_id,
                target_node_id = %member.node_id,
                target_addr = %member.addr,
                "Member has joined the cluster."
            );
            changes.joined.push(member.clone());
        }

        if !changes.joined.is_empty() || !changes.left.is_empty() {
            let _ = membership_changes_tx.send(changes);
        }
        last_members = members;
    }
}
