use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the cluster system.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    /// The number of currently alive members the node is aware of.
    pub(crate) num_live_members: Counter,
    /// The number of members the node currently suspects have failed.
    pub(crate) num_suspect_members: Counter,
    /// The number of members the node currently believes is dead.
    pub(crate) num_dead_members: Counter,
    /// The number of times the hash ring has been rebuilt.
    pub(crate) num_ring_rebuilds: Counter,
    /// The number of replica writes that failed to reach an owner.
    pub(crate) num_failed_replica_writes: Counter,
    /// The number of stale replicas rewritten during reads.
    pub(crate) num_read_repairs: Counter,
    /// The number of entries handed over to their new owners.
    pub(crate) num_handoffs: Counter,
}

impl ClusterStatisticsInner {
    /// The number of currently alive members the node is aware of.
    pub fn num_live_members(&self) -> u64 {
        self.num_live_members.load(Ordering::Relaxed)
    }

    /// The number of members the node currently suspects have failed.
    pub fn num_suspect_members(&self) -> u64 {
        self.num_suspect_members.load(Ordering::Relaxed)
    }

    /// The number of members the node currently believes is dead.
    pub fn num_dead_members(&self) -> u64 {
        self.num_dead_members.load(Ordering::Relaxed)
    }

    /// The number of times the hash ring has been rebuilt.
    pub fn num_ring_rebuilds(&self) -> u64 {
        self.num_ring_rebuilds.load(Ordering::Relaxed)
    }

    /// The number of replica writes that failed to reach an owner.
    pub fn num_failed_replica_writes(&self) -> u64 {
        self.num_failed_replica_writes.load(Ordering::Relaxed)
    }

    /// The number of stale replicas rewritten during reads.
    pub fn num_read_repairs(&self) -> u64 {
        self.num_read_repairs.load(Ordering::Relaxed)
    }

    /// The number of entries handed over to their new owners.
    pub fn num_handoffs(&self) -> u64 {
        self.num_handoffs.load(Ordering::Relaxed)
    }
}
