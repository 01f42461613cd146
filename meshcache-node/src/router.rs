use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use meshcache_rpc::Status;
use tokio::time::Instant;

use crate::clock::{Clock, Version};
use crate::error::NodeError;
use crate::ring::{RingHandle, RingMember};
use crate::rpc::client::CacheClient;
use crate::rpc::network::RpcNetwork;
use crate::rpc::services::cache_impl::WireEntry;
use crate::statistics::ClusterStatistics;
use crate::storage::{CacheEntry, LocalStore};

#[derive(Debug, Clone)]
/// A write executed against every owner of a key.
enum WriteOp {
    Put(CacheEntry),
    Delete(Version),
}

/// Settings controlling how the router talks to owners.
pub(crate) struct RouterConfig {
    pub write_quorum: Option<usize>,
    pub read_repair: bool,
    pub rpc_timeout: Duration,
    pub rpc_attempts: usize,
}

/// Executes cache operations against the owners of each key.
///
/// Owners are looked up on the current ring for every operation, the local
/// node is served from its store directly and remote owners over RPC.
pub(crate) struct Router<S>
where
    S: LocalStore,
{
    inner: Arc<RouterInner<S>>,
}

impl<S> Clone for Router<S>
where
    S: LocalStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RouterInner<S> {
    node_id: String,
    store: Arc<S>,
    ring: RingHandle,
    network: RpcNetwork,
    clock: Clock,
    cfg: RouterConfig,
    statistics: ClusterStatistics,
}

impl<S> Router<S>
where
    S: LocalStore,
{
    pub(crate) fn new(
        node_id: String,
        store: Arc<S>,
        ring: RingHandle,
        network: RpcNetwork,
        clock: Clock,
        cfg: RouterConfig,
        statistics: ClusterStatistics,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                node_id,
                store,
                ring,
                network,
                clock,
                cfg,
                statistics,
            }),
        }
    }

    /// Retrieves a value from the owners of the key.
    ///
    /// Returns `None` if the key is missing or expired on every owner
    /// which answered.
    pub(crate) async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NodeError> {
        let owners = self.owners(key)?;

        if self.inner.cfg.read_repair && owners.len() > 1 {
            return self.get_with_repair(key, owners).await;
        }

        let mut answered = false;
        let mut last_error = None;
        for owner in owners.iter() {
            match self.fetch(owner, key).await {
                Ok(Some(entry)) => return Ok(Some(entry.value)),
                Ok(None) => answered = true,
                Err(e) => {
                    debug!(
                        node_id = %self.inner.node_id,
                        target_node_id = %owner.node_id,
                        error = ?e,
                        "Owner failed to serve read, trying next owner."
                    );
                    last_error = Some(pick_error(last_error, e));
                },
            }
        }

        miss(answered, last_error)
    }

    /// Queries every owner and rewrites any owner holding a stale copy.
    async fn get_with_repair(
        &self,
        key: &[u8],
        owners: Vec<RingMember>,
    ) -> Result<Option<Vec<u8>>, NodeError> {
        let results = join_all(owners.iter().map(|owner| self.fetch(owner, key))).await;

        let mut answered = false;
        let mut last_error = None;
        let mut latest: Option<CacheEntry> = None;
        let mut replies = Vec::with_capacity(owners.len());
        for (owner, result) in owners.into_iter().zip(results) {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(
                        node_id = %self.inner.node_id,
                        target_node_id = %owner.node_id,
                        error = ?e,
                        "Owner failed to serve read."
                    );
                    last_error = Some(pick_error(last_error, e));
                    continue;
                },
            };

            answered = true;
            let version = entry.as_ref().map(|entry| entry.version);
            if let Some(entry) = entry {
                if latest.as_ref().map_or(true, |l| entry.version > l.version) {
                    latest = Some(entry);
                }
            }
            replies.push((owner, version));
        }

        let latest = match latest {
            Some(latest) => latest,
            None => return miss(answered, last_error),
        };

        let stale = replies
            .into_iter()
            .filter(|(_, version)| *version != Some(latest.version))
            .map(|(owner, _)| owner)
            .collect::<Vec<_>>();

        if !stale.is_empty() {
            self.repair(key, &latest, stale);
        }

        Ok(Some(latest.value))
    }

    fn repair(&self, key: &[u8], latest: &CacheEntry, stale: Vec<RingMember>) {
        self.inner
            .statistics
            .num_read_repairs
            .fetch_add(stale.len() as u64, Ordering::Relaxed);

        for owner in stale {
            debug!(
                node_id = %self.inner.node_id,
                target_node_id = %owner.node_id,
                version = %latest.version,
                "Repairing stale replica."
            );

            let router = self.clone();
            let key = key.to_vec();
            let op = WriteOp::Put(latest.clone());
            tokio::spawn(async move {
                if let Err(e) = router.apply(&owner, &key, &op).await {
                    warn!(
                        node_id = %router.inner.node_id,
                        target_node_id = %owner.node_id,
                        error = ?e,
                        "Failed to repair stale replica."
                    );
                }
            });
        }
    }

    /// Stores a value on the owners of the key.
    ///
    /// A zero `ttl` never expires.
    pub(crate) async fn set(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), NodeError> {
        let entry = CacheEntry::new(value, self.inner.clock.next(), ttl);
        self.replicate(key, WriteOp::Put(entry)).await
    }

    /// Removes the key from its owners.
    ///
    /// Removing a missing key succeeds.
    pub(crate) async fn delete(&self, key: Vec<u8>) -> Result<(), NodeError> {
        let version = self.inner.clock.next();
        self.replicate(key, WriteOp::Delete(version)).await
    }

    /// Sends the write to every owner and waits for the write quorum.
    ///
    /// Remote writes are spawned so they keep going once the quorum has
    /// been reached. Owners which applied a failed write keep it.
    async fn replicate(&self, key: Vec<u8>, op: WriteOp) -> Result<(), NodeError> {
        let owners = self.owners(&key)?;
        let required = self.required_acks(owners.len());

        let (tx, rx) = flume::bounded(owners.len());
        let mut acks = 0;
        for owner in owners {
            if owner.node_id == self.inner.node_id {
                match self.apply_local(&key, &op).await {
                    Ok(()) => acks += 1,
                    Err(e) => {
                        warn!(
                            node_id = %self.inner.node_id,
                            error = ?e,
                            "Failed to apply write to local store."
                        );
                        self.inner
                            .statistics
                            .num_failed_replica_writes
                            .fetch_add(1, Ordering::Relaxed);
                    },
                }
                continue;
            }

            let router = self.clone();
            let key = key.clone();
            let op = op.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = router.apply_remote(&owner, &key, &op).await;
                if let Err(e) = result.as_ref() {
                    warn!(
                        node_id = %router.inner.node_id,
                        target_node_id = %owner.node_id,
                        target_addr = %owner.addr,
                        error = ?e,
                        "Failed to replicate write to owner."
                    );
                    router
                        .inner
                        .statistics
                        .num_failed_replica_writes
                        .fetch_add(1, Ordering::Relaxed);
                }
                let _ = tx.send_async(result.is_ok()).await;
            });
        }
        drop(tx);

        while acks < required {
            match rx.recv_async().await {
                Ok(true) => acks += 1,
                Ok(false) => {},
                Err(_) => break,
            }
        }

        if acks < required {
            return Err(NodeError::QuorumFailed { acks, required });
        }

        Ok(())
    }

    /// Forwards locally held entries this node no longer owns to their
    /// current owners, dropping them locally once every owner has them.
    ///
    /// Returns the number of entries handed over.
    pub(crate) async fn handoff_unowned(&self) -> Result<usize, NodeError> {
        let ring = self.inner.ring.load();
        if !ring.contains(&self.inner.node_id) {
            return Ok(0);
        }

        let entries = self.inner.store.entries().await.map_err(store_error)?;

        let mut num_moved = 0;
        for (key, entry) in entries {
            let owners = ring.lookup(&key);
            if owners.is_empty()
                || owners.iter().any(|owner| owner.node_id == self.inner.node_id)
            {
                continue;
            }

            let version = entry.version;
            let op = WriteOp::Put(entry);
            let results =
                join_all(owners.iter().map(|owner| self.apply_remote(owner, &key, &op)))
                    .await;

            if let Some(Err(e)) = results.into_iter().find(Result::is_err) {
                debug!(
                    node_id = %self.inner.node_id,
                    error = ?e,
                    "Failed to hand off entry, keeping it for the next pass."
                );
                continue;
            }

            // Writes landing after the read are newer and survive this.
            self.inner
                .store
                .delete(&key, version)
                .await
                .map_err(store_error)?;
            self.inner
                .statistics
                .num_handoffs
                .fetch_add(1, Ordering::Relaxed);
            num_moved += 1;
        }

        Ok(num_moved)
    }

    fn owners(&self, key: &[u8]) -> Result<Vec<RingMember>, NodeError> {
        let ring = self.inner.ring.load();
        let owners = ring.lookup(key).into_iter().cloned().collect::<Vec<_>>();

        if owners.is_empty() {
            return Err(NodeError::NoOwnerAvailable);
        }

        Ok(owners)
    }

    fn required_acks(&self, num_owners: usize) -> usize {
        self.inner
            .cfg
            .write_quorum
            .unwrap_or(num_owners)
            .min(num_owners)
    }

    fn client(&self, owner: &RingMember) -> CacheClient<S> {
        let channel = self.inner.network.get_or_connect(owner.addr);
        CacheClient::new(channel, self.inner.cfg.rpc_timeout)
    }

    async fn fetch(
        &self,
        owner: &RingMember,
        key: &[u8],
    ) -> Result<Option<CacheEntry>, NodeError> {
        if owner.node_id == self.inner.node_id {
            return self.inner.store.get(key).await.map_err(store_error);
        }

        let client = self.client(owner);
        let entry = self
            .with_retries(&owner.node_id, || client.get(key))
            .await?;

        Ok(entry.map(WireEntry::into_entry))
    }

    async fn apply(
        &self,
        owner: &RingMember,
        key: &[u8],
        op: &WriteOp,
    ) -> Result<(), NodeError> {
        if owner.node_id == self.inner.node_id {
            self.apply_local(key, op).await
        } else {
            self.apply_remote(owner, key, op).await
        }
    }

    /// Applies the write to the local store.
    ///
    /// A write ignored because the store holds a newer version still
    /// counts as acknowledged.
    async fn apply_local(&self, key: &[u8], op: &WriteOp) -> Result<(), NodeError> {
        let store = &self.inner.store;
        match op {
            WriteOp::Put(entry) => store.put(key.to_vec(), entry.clone()).await,
            WriteOp::Delete(version) => store.delete(key, *version).await,
        }
        .map(|_| ())
        .map_err(store_error)
    }

    async fn apply_remote(
        &self,
        owner: &RingMember,
        key: &[u8],
        op: &WriteOp,
    ) -> Result<(), NodeError> {
        let client = self.client(owner);
        match op {
            WriteOp::Put(entry) => {
                let entry = WireEntry::from_entry(entry.clone(), Instant::now());
                self.with_retries(&owner.node_id, || client.put(key, entry.clone()))
                    .await?;
            },
            WriteOp::Delete(version) => {
                self.with_retries(&owner.node_id, || client.delete(key, *version))
                    .await?;
            },
        }

        Ok(())
    }

    /// Runs the call up to the configured number of attempts.
    async fn with_retries<T, F, Fut>(&self, node_id: &str, mut call: F) -> Result<T, NodeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let attempts = self.inner.cfg.rpc_attempts.max(1);

        let mut last_status = None;
        for attempt in 1..=attempts {
            match call().await {
                Ok(reply) => return Ok(reply),
                Err(status) => {
                    trace!(
                        node_id = %self.inner.node_id,
                        target_node_id = %node_id,
                        attempt = attempt,
                        error = %status,
                        "Call to owner failed."
                    );
                    last_status = Some(status);
                },
            }
        }

        let status = last_status.unwrap_or_else(Status::timeout);
        Err(NodeError::from_status(node_id, status))
    }
}

fn store_error<E>(e: E) -> NodeError
where
    E: std::error::Error + Send + Sync + 'static,
{
    NodeError::Store(Box::new(e))
}

/// Keeps the most descriptive error, a deadline only wins if nothing
/// else went wrong.
fn pick_error(previous: Option<NodeError>, error: NodeError) -> NodeError {
    match (previous, error) {
        (Some(previous), NodeError::Timeout { .. })
            if !matches!(previous, NodeError::Timeout { .. }) =>
        {
            previous
        },
        (_, error) => error,
    }
}

/// The result of a read where no owner had the key.
fn miss(
    answered: bool,
    last_error: Option<NodeError>,
) -> Result<Option<Vec<u8>>, NodeError> {
    match last_error {
        Some(e) if !answered => Err(e),
        _ => Ok(None),
    }
}
