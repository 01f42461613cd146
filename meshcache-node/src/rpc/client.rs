use std::time::Duration;

use meshcache_rpc::{Channel, RpcClient, Status};

use crate::clock::Version;
use crate::gossip::GossipMessage;
use crate::rpc::services::cache_impl::{
    CacheService,
    DeletePayload,
    GetPayload,
    PutPayload,
    WireEntry,
    WriteAck,
};
use crate::rpc::services::gossip_impl::GossipService;
use crate::storage::LocalStore;

/// A high level wrapper around the gossip RPC client.
pub struct GossipClient {
    inner: RpcClient<GossipService>,
}

impl GossipClient {
    /// Creates a new gossip client where every message uses the given deadline.
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            inner: RpcClient::new(channel).with_timeout(timeout),
        }
    }

    /// Sends a gossip message and waits for the reply.
    pub async fn send(&self, msg: &GossipMessage) -> Result<GossipMessage, Status> {
        self.inner.send(msg).await
    }
}

/// A high level wrapper around the cache RPC client.
pub struct CacheClient<S>
where
    S: LocalStore,
{
    inner: RpcClient<CacheService<S>>,
}

impl<S> CacheClient<S>
where
    S: LocalStore,
{
    /// Creates a new cache client where every message uses the given deadline.
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            inner: RpcClient::new(channel).with_timeout(timeout),
        }
    }

    /// Fetches the entry of a key from the remote node.
    pub async fn get(&self, key: &[u8]) -> Result<Option<WireEntry>, Status> {
        let payload = GetPayload { key: key.to_vec() };
        let reply = self.inner.send(&payload).await?;
        Ok(reply.entry)
    }

    /// Stores an entry on the remote node.
    pub async fn put(&self, key: &[u8], entry: WireEntry) -> Result<WriteAck, Status> {
        let payload = PutPayload {
            key: key.to_vec(),
            entry,
        };
        self.inner.send(&payload).await
    }

    /// Removes the key from the remote node if it is not newer than `version`.
    pub async fn delete(&self, key: &[u8], version: Version) -> Result<WriteAck, Status> {
        let payload = DeletePayload {
            key: key.to_vec(),
            version,
        };
        self.inner.send(&payload).await
    }
}
