use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::{CacheEntry, LocalStore};
use crate::clock::Version;

const NUM_SHARDS: usize = 16;

#[derive(Default)]
struct Shard {
    entries: HashMap<Vec<u8>, CacheEntry>,
    /// Keys of the entries which expire, ordered by when they expire.
    expiries: BTreeSet<(Instant, Vec<u8>)>,
}

impl Shard {
    fn get(&self, key: &[u8], now: Instant) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    fn insert(&mut self, key: Vec<u8>, entry: CacheEntry) {
        self.remove(&key);
        if let Some(at) = entry.expires_at {
            self.expiries.insert((at, key.clone()));
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(at) = entry.expires_at {
            self.expiries.remove(&(at, key.to_vec()));
        }
        Some(entry)
    }

    /// Removes the entries expired at `now`, returns the number removed.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        loop {
            let key = match self.expiries.iter().next() {
                Some((at, key)) if *at <= now => key.clone(),
                _ => break,
            };
            self.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Frees a slot in a full shard.
    ///
    /// Expired entries are dropped first, otherwise the entry closest to
    /// expiring, and only then an entry which never expires.
    fn evict(&mut self, now: Instant) {
        if self.purge_expired(now) > 0 {
            return;
        }

        let victim = match self.expiries.iter().next() {
            Some((_, key)) => Some(key.clone()),
            None => self.entries.keys().next().cloned(),
        };

        if let Some(key) = victim {
            self.remove(&key);
        }
    }
}

/// A bounded, sharded in-memory store.
///
/// Keys are spread across shards by their crc32 hash, each shard holding
/// an equal part of the capacity behind its own lock. Each shard indexes
/// its entries by expiry so purging and eviction never scan the shard.
pub struct MemStore {
    shards: Vec<RwLock<Shard>>,
    shard_capacity: usize,
}

impl MemStore {
    /// Creates a new store holding roughly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let num_shards = NUM_SHARDS.min(capacity.max(1));
        let shard_capacity = (capacity / num_shards).max(1);

        Self {
            shards: (0..num_shards).map(|_| RwLock::new(Shard::default())).collect(),
            shard_capacity,
        }
    }

    /// The number of entries held, including expired entries which
    /// have not been purged yet.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &[u8]) -> &RwLock<Shard> {
        let idx = crc32fast::hash(key) as usize % self.shards.len();
        &self.shards[idx]
    }
}

#[async_trait]
impl LocalStore for MemStore {
    type Error = Infallible;

    async fn get(&self, key: &[u8]) -> Result<Option<CacheEntry>, Self::Error> {
        let now = Instant::now();
        let shard = self.shard(key).read();
        Ok(shard.get(key, now).cloned())
    }

    async fn put(&self, key: Vec<u8>, entry: CacheEntry) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let mut shard = self.shard(&key).write();

        match shard.get(&key, now) {
            Some(existing) if existing.version >= entry.version => return Ok(false),
            Some(_) => {},
            None => {
                if !shard.entries.contains_key(&key)
                    && shard.entries.len() >= self.shard_capacity
                {
                    shard.evict(now);
                }
            },
        }

        shard.insert(key, entry);
        Ok(true)
    }

    async fn delete(&self, key: &[u8], version: Version) -> Result<bool, Self::Error> {
        let mut shard = self.shard(key).write();
        match shard.entries.get(key) {
            Some(existing) if existing.version <= version => {
                shard.remove(key);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn entries(&self) -> Result<Vec<(Vec<u8>, CacheEntry)>, Self::Error> {
        let now = Instant::now();
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            entries.extend(
                shard
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_expired(now))
                    .map(|(key, entry)| (key.clone(), entry.clone())),
            );
        }
        Ok(entries)
    }

    async fn purge_expired(&self) -> Result<usize, Self::Error> {
        let now = Instant::now();
        let removed = self
            .shards
            .iter()
            .map(|shard| shard.write().purge_expired(now))
            .sum();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn version(millis: u64) -> Version {
        Version::new(millis, 0, 1)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemStore::new(100);
        let entry = CacheEntry::new(b"v".to_vec(), version(1), Duration::ZERO);

        assert!(store.put(b"k".to_vec(), entry.clone()).await.unwrap());
        assert_eq!(store.get(b"k").await.unwrap(), Some(entry));

        assert!(store.delete(b"k", version(2)).await.unwrap());
        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert!(
            !store.delete(b"k", version(3)).await.unwrap(),
            "Deleting a missing key is a no-op."
        );
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemStore::new(100);
        let newer = CacheEntry::new(b"new".to_vec(), version(5), Duration::ZERO);
        let older = CacheEntry::new(b"old".to_vec(), version(3), Duration::ZERO);

        assert!(store.put(b"k".to_vec(), newer.clone()).await.unwrap());
        assert!(!store.put(b"k".to_vec(), older).await.unwrap());
        assert!(!store.put(b"k".to_vec(), newer.clone()).await.unwrap());
        assert_eq!(store.get(b"k").await.unwrap(), Some(newer));

        assert!(
            !store.delete(b"k", version(4)).await.unwrap(),
            "An older delete must not remove a newer value."
        );
        assert!(store.get(b"k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemStore::new(100);
        let entry = CacheEntry::new(b"v".to_vec(), version(1), Duration::from_millis(50));
        store.put(b"k".to_vec(), entry).await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get(b"k").await.unwrap(), None);
        assert!(store.entries().await.unwrap().is_empty());
        assert_eq!(store.len(), 1, "Expired entries stay until purged.");

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty());

        // An expired entry can be replaced by any version.
        let entry = CacheEntry::new(b"v".to_vec(), version(1), Duration::from_millis(1));
        store.put(b"k".to_vec(), entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let entry = CacheEntry::new(b"v2".to_vec(), version(0), Duration::ZERO);
        assert!(store.put(b"k".to_vec(), entry).await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let store = MemStore::new(32);
        for i in 0..500u64 {
            let ttl = Duration::from_secs(60 + i);
            let entry = CacheEntry::new(i.to_le_bytes().to_vec(), version(i), ttl);
            store.put(format!("key-{i}").into_bytes(), entry).await.unwrap();
        }

        assert!(store.len() <= 32, "Store grew to {}", store.len());

        // The most recently written key has the longest ttl so survives.
        assert!(store.get(b"key-499").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_prefers_expired_entries() {
        let store = MemStore::new(1);
        let short = CacheEntry::new(b"a".to_vec(), version(1), Duration::from_millis(1));
        store.put(b"a".to_vec(), short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let forever = CacheEntry::new(b"b".to_vec(), version(2), Duration::ZERO);
        store.put(b"b".to_vec(), forever).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(b"b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rewrites_keep_expiry_index_in_sync() {
        let store = MemStore::new(1);
        let entry = CacheEntry::new(b"v1".to_vec(), version(1), Duration::from_millis(1));
        store.put(b"k".to_vec(), entry).await.unwrap();

        // Replacing the entry drops its old expiry.
        let entry = CacheEntry::new(b"v2".to_vec(), version(2), Duration::ZERO);
        store.put(b"k".to_vec(), entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.get(b"k").await.unwrap().unwrap().value, b"v2");

        // A full shard with nothing expiring still makes room.
        let entry = CacheEntry::new(b"v".to_vec(), version(3), Duration::ZERO);
        assert!(store.put(b"other".to_vec(), entry).await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.get(b"other").await.unwrap().is_some());
    }
}
