mod rebuild;

use std::net::SocketAddr;

pub(crate) use rebuild::run_ring_rebuilder;
pub use rebuild::RingHandle;
use smallvec::SmallVec;

use crate::membership::MembershipSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A physical node placed on the ring.
pub struct RingMember {
    pub node_id: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// A single position on the ring owned by a physical node.
struct VirtualNode {
    hash: u64,
    /// The index of the owning member in [HashRing::members].
    owner: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An immutable consistent hash ring.
///
/// Each physical node owns up to `V` positions derived from
/// `blake3(node_id ++ index)`. A key is owned by the first position at or
/// after the key's hash, wrapping past the end, and replicated onto the
/// next distinct nodes walking clockwise.
pub struct HashRing {
    members: Vec<RingMember>,
    vnodes: Vec<VirtualNode>,
    replication_factor: usize,
}

impl HashRing {
    /// Creates a ring with no members.
    pub fn empty(replication_factor: usize) -> Self {
        Self {
            members: Vec::new(),
            vnodes: Vec::new(),
            replication_factor,
        }
    }

    /// Builds a ring from the given members.
    ///
    /// The same set of members always produces the same ring regardless
    /// of the order they are provided in.
    pub fn build(
        members: impl IntoIterator<Item = RingMember>,
        virtual_nodes: usize,
        replication_factor: usize,
    ) -> Self {
        let mut members = members.into_iter().collect::<Vec<_>>();
        members.sort();
        members.dedup_by(|a, b| a.node_id == b.node_id);

        let mut vnodes = Vec::with_capacity(members.len() * virtual_nodes);
        for (owner, member) in members.iter().enumerate() {
            for index in 0..virtual_nodes {
                vnodes.push(VirtualNode {
                    hash: vnode_hash(&member.node_id, index as u32),
                    owner,
                });
            }
        }

        // The sort is stable so on a collision the position inserted first
        // is kept and the later ones discarded.
        vnodes.sort_by_key(|vnode| vnode.hash);
        vnodes.dedup_by_key(|vnode| vnode.hash);

        Self {
            members,
            vnodes,
            replication_factor,
        }
    }

    /// Builds a ring from every member of the snapshot which is not dead.
    pub fn from_snapshot(
        snapshot: &MembershipSnapshot,
        virtual_nodes: usize,
        replication_factor: usize,
    ) -> Self {
        let members = snapshot.non_dead().map(|member| RingMember {
            node_id: member.node_id.clone(),
            addr: member.addr,
        });
        Self::build(members, virtual_nodes, replication_factor)
    }

    /// Returns the ordered owners of the key.
    ///
    /// The first owner is the primary, followed by up to `R - 1` distinct
    /// replicas. Empty if the ring has no members.
    pub fn lookup(&self, key: &[u8]) -> Vec<&RingMember> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let wanted = self.replication_factor.min(self.members.len());
        let start = self.successor(key_hash(key));

        let mut owners = SmallVec::<[usize; 4]>::new();
        for offset in 0..self.vnodes.len() {
            let vnode = self.vnodes[(start + offset) % self.vnodes.len()];
            if !owners.contains(&vnode.owner) {
                owners.push(vnode.owner);
                if owners.len() == wanted {
                    break;
                }
            }
        }

        owners.into_iter().map(|idx| &self.members[idx]).collect()
    }

    #[inline]
    /// The physical members of the ring, ordered by id.
    pub fn members(&self) -> &[RingMember] {
        &self.members
    }

    #[inline]
    /// Returns if the given node is part of the ring.
    pub fn contains(&self, node_id: &str) -> bool {
        self.members.iter().any(|member| member.node_id == node_id)
    }

    #[inline]
    /// The number of positions on the ring.
    pub fn num_vnodes(&self) -> usize {
        self.vnodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The index of the first position with a hash at or after `hash`.
    fn successor(&self, hash: u64) -> usize {
        let idx = self.vnodes.partition_point(|vnode| vnode.hash < hash);
        if idx == self.vnodes.len() {
            0
        } else {
            idx
        }
    }
}

fn vnode_hash(node_id: &str, index: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node_id.as_bytes());
    hasher.update(&index.to_le_bytes());
    truncate(hasher.finalize())
}

/// The position of a key on the ring.
pub fn key_hash(key: &[u8]) -> u64 {
    truncate(blake3::hash(key))
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<RingMember> {
        (0..n)
            .map(|i| RingMember {
                node_id: format!("node-{i}"),
                addr: format!("127.0.0.1:{}", 8000 + i).parse().unwrap(),
            })
            .collect()
    }

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::empty(2);
        assert!(ring.is_empty());
        assert!(ring.lookup(b"hello").is_empty());

        let ring = HashRing::build(Vec::new(), 160, 1);
        assert!(ring.lookup(b"hello").is_empty());
    }

    #[test]
    fn test_build_is_deterministic() {
        let forward = HashRing::build(members(5), 64, 2);
        let mut reversed = members(5);
        reversed.reverse();
        let reversed = HashRing::build(reversed, 64, 2);
        assert_eq!(forward, reversed, "Member order must not change the ring.");

        for key in keys(1_000) {
            assert_eq!(forward.lookup(&key), forward.lookup(&key));
            assert_eq!(forward.lookup(&key), reversed.lookup(&key));
        }
    }

    #[test]
    fn test_positions_are_unique() {
        let ring = HashRing::build(members(10), 160, 1);
        assert!(ring.num_vnodes() <= 10 * 160);
        assert!(ring
            .vnodes
            .windows(2)
            .all(|pair| pair[0].hash < pair[1].hash));
    }

    #[test]
    fn test_lookup_returns_distinct_replicas() {
        let ring = HashRing::build(members(5), 32, 3);
        for key in keys(500) {
            let owners = ring.lookup(&key);
            assert_eq!(owners.len(), 3);
            let mut ids = owners.iter().map(|o| &o.node_id).collect::<Vec<_>>();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 3, "Replicas must be distinct nodes.");
        }

        // Fewer members than the replication factor.
        let ring = HashRing::build(members(2), 32, 3);
        assert_eq!(ring.lookup(b"key").len(), 2);
    }

    #[test]
    fn test_lookup_matches_successor_rule() {
        let ring = HashRing::build(members(4), 16, 1);
        for key in keys(200) {
            let hash = key_hash(&key);
            let expected = ring
                .vnodes
                .iter()
                .find(|vnode| vnode.hash >= hash)
                .unwrap_or(&ring.vnodes[0]);
            let owner = &ring.members[expected.owner];
            assert_eq!(ring.lookup(&key), vec![owner]);
        }
    }

    #[test]
    fn test_removing_a_node_moves_few_keys() {
        let n = 10;
        let sample = keys(20_000);
        let full = HashRing::build(members(n), 160, 1);

        let removed = "node-3";
        let remaining = members(n)
            .into_iter()
            .filter(|m| m.node_id != removed)
            .collect::<Vec<_>>();
        let reduced = HashRing::build(remaining, 160, 1);

        let mut moved = 0;
        for key in &sample {
            let before = &full.lookup(key)[0].node_id;
            let after = &reduced.lookup(key)[0].node_id;
            if before != after {
                assert_eq!(before, removed, "Only keys of the removed node may move.");
                moved += 1;
            }
        }

        let fraction = moved as f64 / sample.len() as f64;
        assert!(
            fraction > 0.0 && fraction < 0.2,
            "Expected roughly 1/{n} of keys to move, got {fraction}"
        );
    }

    #[test]
    fn test_load_is_spread() {
        let n = 8;
        let ring = HashRing::build(members(n), 160, 1);
        let mut counts = std::collections::HashMap::new();
        for key in keys(40_000) {
            *counts.entry(ring.lookup(&key)[0].node_id.clone()).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), n);
        let mean = 40_000 / n;
        for count in counts.values() {
            assert!(
                *count > mean / 2 && *count < mean * 2,
                "Key distribution too uneven: {counts:?}"
            );
        }
    }
}
