use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use rkyv::{Archive, Deserialize, Serialize};
use tokio::time::Instant;

#[derive(
    Serialize,
    Deserialize,
    Archive,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
/// The liveness of a member as seen by this node.
///
/// Within one incarnation states only ever move forward in the order
/// `Alive -> Suspect -> Dead`.
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// The gossiped form of a member.
pub struct NodeRecord {
    pub node_id: String,
    pub addr: String,
    pub state: NodeState,
    pub incarnation: u64,
}

/// Returns if the `(incarnation, state)` pair `new` should replace `current`.
///
/// A higher incarnation always wins. Within the same incarnation only a
/// forward state transition wins, a node can never come back to life
/// without bumping its incarnation.
pub fn supersedes(new: (u64, NodeState), current: (u64, NodeState)) -> bool {
    let (new_incarnation, new_state) = new;
    let (incarnation, state) = current;

    new_incarnation > incarnation || (new_incarnation == incarnation && new_state > state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A member of the cluster.
pub struct Member {
    pub node_id: String,
    pub addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    /// The last time we had first hand evidence the member is alive.
    pub last_heard: Instant,
    /// When the member entered its current state.
    pub state_changed_at: Instant,
}

impl Member {
    pub fn new(node_id: impl Into<String>, addr: SocketAddr, now: Instant) -> Self {
        Self {
            node_id: node_id.into(),
            addr,
            state: NodeState::Alive,
            incarnation: 0,
            last_heard: now,
            state_changed_at: now,
        }
    }

    /// The gossiped form of the member.
    pub fn to_record(&self) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id.clone(),
            addr: self.addr.to_string(),
            state: self.state,
            incarnation: self.incarnation,
        }
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state == NodeState::Dead
    }

    fn set_state(&mut self, state: NodeState, now: Instant) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = now;
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The effect merging a record had on the table.
pub enum MergeOutcome {
    /// The member was not known before.
    Inserted,
    /// The record replaced the known state of the member.
    Updated,
    /// The record claimed this node is not alive, the node bumped its
    /// incarnation to refute it.
    Refuted,
    /// The record is the same as the known state.
    Unchanged,
    /// The record is older than the known state and was dropped.
    Stale,
    /// The record could not be understood and was dropped.
    Invalid,
}

impl MergeOutcome {
    #[inline]
    /// Returns if the table changed and the record should be disseminated.
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Refuted)
    }
}

/// The node's view of the cluster.
///
/// The table is owned by the gossip engine which is the only writer,
/// everything else reads immutable [MembershipSnapshot]s.
pub struct MembershipTable {
    me: Member,
    peers: BTreeMap<String, Member>,
}

impl MembershipTable {
    /// Creates a table containing only this node.
    pub fn new(me: Member) -> Self {
        Self {
            me,
            peers: BTreeMap::new(),
        }
    }

    #[inline]
    /// This node's own member.
    pub fn me(&self) -> &Member {
        &self.me
    }

    #[inline]
    pub fn get(&self, node_id: &str) -> Option<&Member> {
        if node_id == self.me.node_id {
            return Some(&self.me);
        }
        self.peers.get(node_id)
    }

    #[inline]
    /// The number of known members including this node.
    pub fn num_members(&self) -> usize {
        self.peers.len() + 1
    }

    /// Merges a gossiped record into the table.
    pub fn merge(&mut self, record: &NodeRecord, now: Instant) -> MergeOutcome {
        if record.node_id == self.me.node_id {
            return self.merge_self(record, now);
        }

        let addr = match record.addr.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => return MergeOutcome::Invalid,
        };

        let member = match self.peers.get_mut(&record.node_id) {
            Some(member) => member,
            None => {
                let mut member = Member::new(record.node_id.clone(), addr, now);
                member.state = record.state;
                member.incarnation = record.incarnation;
                self.peers.insert(record.node_id.clone(), member);
                return MergeOutcome::Inserted;
            },
        };

        let incoming = (record.incarnation, record.state);
        let current = (member.incarnation, member.state);
        if incoming == current {
            return MergeOutcome::Unchanged;
        }

        if !supersedes(incoming, current) {
            return MergeOutcome::Stale;
        }

        member.incarnation = record.incarnation;
        member.addr = addr;
        member.set_state(record.state, now);
        MergeOutcome::Updated
    }

    fn merge_self(&mut self, record: &NodeRecord, now: Instant) -> MergeOutcome {
        let me = &mut self.me;

        let refute = record.incarnation > me.incarnation
            || (record.incarnation == me.incarnation && record.state != NodeState::Alive);

        if !refute {
            return if record.incarnation == me.incarnation {
                MergeOutcome::Unchanged
            } else {
                MergeOutcome::Stale
            };
        }

        me.incarnation = record.incarnation + 1;
        me.set_state(NodeState::Alive, now);
        MergeOutcome::Refuted
    }

    /// Marks our own member as dead, used when leaving the cluster.
    pub fn mark_self_dead(&mut self, now: Instant) -> NodeRecord {
        self.me.set_state(NodeState::Dead, now);
        self.me.to_record()
    }

    /// Records first hand evidence that the member is alive.
    pub fn touch(&mut self, node_id: &str, now: Instant) {
        if let Some(member) = self.peers.get_mut(node_id) {
            member.last_heard = now;
        }
    }

    /// Marks a member as suspect after it failed a probe.
    ///
    /// The suspicion is only applied if the member is still alive at the
    /// incarnation that was probed, so a refutation that landed while the
    /// probe was in flight is kept.
    pub fn suspect(&mut self, node_id: &str, incarnation: u64, now: Instant) -> bool {
        match self.peers.get_mut(node_id) {
            Some(member)
                if member.state == NodeState::Alive
                    && member.incarnation == incarnation =>
            {
                member.set_state(NodeState::Suspect, now);
                true
            },
            _ => false,
        }
    }

    /// Promotes members which have been suspect for longer than the timeout.
    ///
    /// Returns the ids of the members now considered dead.
    pub fn expire_suspects(&mut self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for member in self.peers.values_mut() {
            if member.state == NodeState::Suspect
                && now.saturating_duration_since(member.state_changed_at) >= timeout
            {
                member.set_state(NodeState::Dead, now);
                expired.push(member.node_id.clone());
            }
        }
        expired
    }

    /// Forgets members which have been dead for longer than the retention period.
    pub fn purge_dead(&mut self, retention: Duration, now: Instant) -> Vec<String> {
        let mut purged = Vec::new();
        self.peers.retain(|node_id, member| {
            let keep = !member.is_dead()
                || now.saturating_duration_since(member.state_changed_at) < retention;
            if !keep {
                purged.push(node_id.clone());
            }
            keep
        });
        purged
    }

    /// All peers which are not known to be dead, excluding this node.
    pub fn live_peers(&self) -> impl Iterator<Item = &Member> + '_ {
        self.peers.values().filter(|member| !member.is_dead())
    }

    #[inline]
    /// The gossiped form of a member.
    pub fn record(&self, node_id: &str) -> Option<NodeRecord> {
        self.get(node_id).map(Member::to_record)
    }

    /// The gossiped form of every member, including this node.
    pub fn records(&self) -> Vec<NodeRecord> {
        std::iter::once(&self.me)
            .chain(self.peers.values())
            .map(Member::to_record)
            .collect()
    }

    /// Produces an immutable copy of the table.
    pub fn snapshot(&self) -> MembershipSnapshot {
        let mut members = self.peers.clone();
        members.insert(self.me.node_id.clone(), self.me.clone());

        MembershipSnapshot {
            me: self.me.node_id.clone(),
            members,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// An immutable view of the membership table at a point in time.
pub struct MembershipSnapshot {
    me: String,
    members: BTreeMap<String, Member>,
}

impl MembershipSnapshot {
    #[inline]
    /// The id of the node which produced the snapshot.
    pub fn me(&self) -> &str {
        &self.me
    }

    #[inline]
    pub fn get(&self, node_id: &str) -> Option<&Member> {
        self.members.get(node_id)
    }

    #[inline]
    /// The state of the given member if known.
    pub fn state_of(&self, node_id: &str) -> Option<NodeState> {
        self.members.get(node_id).map(|member| member.state)
    }

    /// Every known member including this node, ordered by id.
    pub fn members(&self) -> impl Iterator<Item = &Member> + '_ {
        self.members.values()
    }

    /// Members which are not known to be dead, ordered by id.
    pub fn non_dead(&self) -> impl Iterator<Item = &Member> + '_ {
        self.members.values().filter(|member| !member.is_dead())
    }

    /// The number of members in the given state.
    pub fn count(&self, state: NodeState) -> usize {
        self.members.values().filter(|m| m.state == state).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
