mod memory;

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
pub use memory::MemStore;
use tokio::time::Instant;

use crate::clock::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single value held by a node.
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub version: Version,
    /// When the entry stops being visible, `None` never expires.
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    /// Creates a new entry expiring after `ttl`.
    ///
    /// A zero ttl, or one too large to represent as a point in time,
    /// never expires.
    pub fn new(value: Vec<u8>, version: Version, ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };

        Self {
            value,
            version,
            expires_at,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// The time left before the entry expires.
    ///
    /// Returns `Duration::ZERO` for entries that never expire, matching the
    /// ttl convention of [CacheEntry::new].
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        match self.expires_at {
            None => Duration::ZERO,
            // An entry that expired in flight keeps a minimal ttl
            // instead of becoming immortal.
            Some(at) => at
                .saturating_duration_since(now)
                .max(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
/// The node local key value store.
///
/// The store is shared between every concurrent request and must handle
/// its own synchronization. Expiry and bounded size eviction are its own
/// responsibility, expired entries must never be returned.
///
/// Writes are last-writer-wins on the entry version, a write carrying an
/// older version than the stored one must be ignored.
pub trait LocalStore: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Retrieves a live entry.
    async fn get(&self, key: &[u8]) -> Result<Option<CacheEntry>, Self::Error>;

    /// Stores an entry, returns if it was applied.
    async fn put(&self, key: Vec<u8>, entry: CacheEntry) -> Result<bool, Self::Error>;

    /// Removes the entry if it is not newer than `version`, returns if
    /// an entry was removed.
    async fn delete(&self, key: &[u8], version: Version) -> Result<bool, Self::Error>;

    /// Every live entry held by the store.
    async fn entries(&self) -> Result<Vec<(Vec<u8>, CacheEntry)>, Self::Error>;

    /// Removes expired entries, returns the number removed.
    async fn purge_expired(&self) -> Result<usize, Self::Error>;
}
