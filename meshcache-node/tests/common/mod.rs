#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshcache_node::{
    CacheEntry,
    CacheNode,
    GossipConfig,
    LocalStore,
    MemStore,
    NodeConfig,
    Version,
};

pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Gossip timings fast enough for tests to observe failures quickly.
pub fn fast_gossip() -> GossipConfig {
    GossipConfig {
        gossip_interval: Duration::from_millis(100),
        direct_probe_timeout: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(250),
        suspicion_timeout: Duration::from_secs(1),
        dead_node_retention: Duration::from_secs(60),
        join_retry_interval: Duration::from_millis(200),
        ..GossipConfig::default()
    }
}

pub fn node_config(node_id: &str, addr: SocketAddr, seeds: &[SocketAddr]) -> NodeConfig {
    NodeConfig::new(node_id, addr)
        .with_seed_nodes(seeds.iter().map(|seed| seed.to_string()))
        .with_gossip(fast_gossip())
        .with_rpc_timeout(Duration::from_millis(500), 2)
}

/// Waits until every node's ring contains `num_members` members.
pub async fn wait_for_ring<S>(nodes: &[&CacheNode<S>], num_members: usize) -> bool
where
    S: LocalStore,
{
    for node in nodes {
        let converged = test_helper::wait_until(CONVERGE_TIMEOUT, move || async move {
            node.ring().members().len() == num_members
        })
        .await;

        if !converged {
            return false;
        }
    }

    true
}

#[derive(Clone)]
/// A store the test keeps a handle to, so replicas can be inspected
/// and modified directly.
pub struct SharedStore(pub Arc<MemStore>);

impl SharedStore {
    pub fn new() -> Self {
        Self(Arc::new(MemStore::new(10_000)))
    }
}

#[async_trait::async_trait]
impl LocalStore for SharedStore {
    type Error = Infallible;

    async fn get(&self, key: &[u8]) -> Result<Option<CacheEntry>, Self::Error> {
        self.0.get(key).await
    }

    async fn put(&self, key: Vec<u8>, entry: CacheEntry) -> Result<bool, Self::Error> {
        self.0.put(key, entry).await
    }

    async fn delete(&self, key: &[u8], version: Version) -> Result<bool, Self::Error> {
        self.0.delete(key, version).await
    }

    async fn entries(&self) -> Result<Vec<(Vec<u8>, CacheEntry)>, Self::Error> {
        self.0.entries().await
    }

    async fn purge_expired(&self) -> Result<usize, Self::Error> {
        self.0.purge_expired().await
    }
}
