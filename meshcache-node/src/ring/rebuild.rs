use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use super::{HashRing, RingMember};
use crate::membership::MembershipSnapshot;
use crate::statistics::ClusterStatistics;

#[derive(Clone)]
/// A shared handle to the current hash ring.
///
/// Readers load the ring without locking and never observe a partially
/// built ring, rebuilds publish a whole new ring in a single swap.
pub struct RingHandle(Arc<ArcSwap<HashRing>>);

impl RingHandle {
    pub fn new(ring: HashRing) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(ring)))
    }

    #[inline]
    /// The current ring.
    pub fn load(&self) -> Arc<HashRing> {
        self.0.load_full()
    }

    #[inline]
    pub(crate) fn store(&self, ring: HashRing) {
        self.0.store(Arc::new(ring));
    }
}

fn ring_members(snapshot: &MembershipSnapshot) -> BTreeSet<RingMember> {
    snapshot
        .non_dead()
        .map(|member| RingMember {
            node_id: member.node_id.clone(),
            addr: member.addr,
        })
        .collect()
}

/// Rebuilds the ring whenever the set of non-dead members changes.
///
/// Changes are compared against the members of the published ring, so a
/// change that lands before the task first runs is still built. After a
/// change is seen the task waits out the debounce window so a burst of
/// changes produces a single rebuild.
pub(crate) async fn run_ring_rebuilder(
    node_id: String,
    ring: RingHandle,
    mut snapshots: watch::Receiver<Arc<MembershipSnapshot>>,
    virtual_nodes: usize,
    replication_factor: usize,
    debounce: Duration,
    statistics: ClusterStatistics,
) {
    let mut current = ring
        .load()
        .members()
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>();

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let members = ring_members(&snapshot);
        if members != current {
            let new_ring = HashRing::build(
                members.iter().cloned(),
                virtual_nodes,
                replication_factor,
            );

            info!(
                node_id = %node_id,
                num_members = new_ring.members().len(),
                num_vnodes = new_ring.num_vnodes(),
                "Hash ring rebuilt."
            );

            ring.store(new_ring);
            statistics.num_ring_rebuilds.fetch_add(1, Ordering::Relaxed);
            current = members;
        }

        if snapshots.changed().await.is_err() {
            break;
        }

        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
    }

    debug!(node_id = %node_id, "Ring rebuilder stopped.");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::time::Instant;

    use super::*;
    use crate::membership::{Member, MembershipTable, NodeRecord, NodeState};

    fn record(node_id: &str, port: u16, state: NodeState) -> NodeRecord {
        NodeRecord {
            node_id: node_id.to_string(),
            addr: format!("127.0.0.1:{port}"),
            state,
            incarnation: 0,
        }
    }

    #[tokio::test]
    async fn test_rebuild_is_debounced() {
        let addr: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        let mut table = MembershipTable::new(Member::new("me", addr, Instant::now()));
        let (tx, rx) = watch::channel(Arc::new(table.snapshot()));

        let ring = RingHandle::new(HashRing::from_snapshot(&table.snapshot(), 16, 1));
        let statistics = ClusterStatistics::default();
        tokio::spawn(run_ring_rebuilder(
            "me".to_string(),
            ring.clone(),
            rx,
            16,
            1,
            Duration::from_millis(100),
            statistics.clone(),
        ));

        // A burst of changes within the window.
        for (i, node_id) in ["a", "b", "c"].into_iter().enumerate() {
            table.merge(&record(node_id, 9000 + i as u16, NodeState::Alive), Instant::now());
            tx.send_replace(Arc::new(table.snapshot()));
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ring.load().members().len(), 4);
        assert_eq!(statistics.num_ring_rebuilds(), 1);

        // Suspect members keep their place on the ring.
        table.suspect("a", 0, Instant::now());
        tx.send_replace(Arc::new(table.snapshot()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(statistics.num_ring_rebuilds(), 1);

        table.merge(&record("a", 9000, NodeState::Dead), Instant::now());
        tx.send_replace(Arc::new(table.snapshot()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(statistics.num_ring_rebuilds(), 2);
        assert!(!ring.load().contains("a"));
    }

    #[tokio::test]
    async fn test_changes_before_first_run_are_built() {
        let addr: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        let mut table = MembershipTable::new(Member::new("me", addr, Instant::now()));
        let ring = RingHandle::new(HashRing::from_snapshot(&table.snapshot(), 16, 1));
        let (tx, mut rx) = watch::channel(Arc::new(table.snapshot()));

        // The receiver has already seen the latest snapshot when the task starts.
        table.merge(&record("a", 9000, NodeState::Alive), Instant::now());
        tx.send_replace(Arc::new(table.snapshot()));
        rx.borrow_and_update();

        let statistics = ClusterStatistics::default();
        tokio::spawn(run_ring_rebuilder(
            "me".to_string(),
            ring.clone(),
            rx,
            16,
            1,
            Duration::ZERO,
            statistics.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ring.load().contains("a"));
        assert_eq!(statistics.num_ring_rebuilds(), 1);
    }
}
