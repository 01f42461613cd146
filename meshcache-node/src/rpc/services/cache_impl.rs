use std::sync::Arc;
use std::time::Duration;

use meshcache_rpc::{Handler, Request, RpcService, ServiceRegistry, Status};
use rkyv::{Archive, Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{Clock, Version};
use crate::storage::{CacheEntry, LocalStore};

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// A cache entry as sent between nodes.
pub struct WireEntry {
    pub value: Vec<u8>,
    pub version: Version,
    /// The remaining time to live in milliseconds, `0` never expires.
    pub ttl_ms: u64,
}

impl WireEntry {
    pub fn from_entry(entry: CacheEntry, now: Instant) -> Self {
        Self {
            ttl_ms: entry.remaining_ttl(now).as_millis() as u64,
            value: entry.value,
            version: entry.version,
        }
    }

    pub fn into_entry(self) -> CacheEntry {
        CacheEntry::new(self.value, self.version, Duration::from_millis(self.ttl_ms))
    }
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct GetPayload {
    pub key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct GetReply {
    pub entry: Option<WireEntry>,
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PutPayload {
    pub key: Vec<u8>,
    pub entry: WireEntry,
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct DeletePayload {
    pub key: Vec<u8>,
    pub version: Version,
}

#[derive(Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// The acknowledgement of a replica write.
pub struct WriteAck {
    /// If the write changed the replica, older writes are acknowledged
    /// without being applied.
    pub applied: bool,
}

/// Serves cache operations routed to this node by other nodes.
///
/// Requests are always executed against the local store, even if the
/// ring has changed and this node no longer owns the key.
pub struct CacheService<S> {
    store: Arc<S>,
    clock: Clock,
}

impl<S> CacheService<S> {
    pub fn new(store: Arc<S>, clock: Clock) -> Self {
        Self { store, clock }
    }

    fn observe(&self, version: Version) {
        if let Err(e) = self.clock.observe(version) {
            warn!(error = %e, version = %version, "Refusing to follow drifted remote clock.");
        }
    }
}

impl<S> RpcService for CacheService<S>
where
    S: LocalStore,
{
    fn service_name() -> &'static str {
        "meshcache.cache"
    }

    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<GetPayload>();
        registry.add_handler::<PutPayload>();
        registry.add_handler::<DeletePayload>();
    }
}

#[meshcache_rpc::async_trait]
impl<S> Handler<GetPayload> for CacheService<S>
where
    S: LocalStore,
{
    type Reply = GetReply;

    fn path() -> &'static str {
        "get"
    }

    async fn on_message(&self, msg: Request<GetPayload>) -> Result<Self::Reply, Status> {
        let payload = msg.to_owned()?;
        let entry = self
            .store
            .get(&payload.key)
            .await
            .map_err(Status::internal)?;

        Ok(GetReply {
            entry: entry.map(|entry| WireEntry::from_entry(entry, Instant::now())),
        })
    }
}

#[meshcache_rpc::async_trait]
impl<S> Handler<PutPayload> for CacheService<S>
where
    S: LocalStore,
{
    type Reply = WriteAck;

    fn path() -> &'static str {
        "put"
    }

    async fn on_message(&self, msg: Request<PutPayload>) -> Result<Self::Reply, Status> {
        let payload = msg.to_owned()?;
        self.observe(payload.entry.version);

        let applied = self
            .store
            .put(payload.key, payload.entry.into_entry())
            .await
            .map_err(Status::internal)?;

        Ok(WriteAck { applied })
    }
}

#[meshcache_rpc::async_trait]
impl<S> Handler<DeletePayload> for CacheService<S>
where
    S: LocalStore,
{
    type Reply = WriteAck;

    fn path() -> &'static str {
        "delete"
    }

    async fn on_message(
        &self,
        msg: Request<DeletePayload>,
    ) -> Result<Self::Reply, Status> {
        let payload = msg.to_owned()?;
        self.observe(payload.version);

        let applied = self
            .store
            .delete(&payload.key, payload.version)
            .await
            .map_err(Status::internal)?;

        Ok(WriteAck { applied })
    }
}
