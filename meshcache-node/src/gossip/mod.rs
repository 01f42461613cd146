//! SWIM style membership and failure detection.
//!
//! A single engine task owns the [MembershipTable](crate::membership::MembershipTable).
//! Once per gossip period it probes one peer, peers are visited in a shuffled
//! round robin. A peer that does not answer a direct ping is probed indirectly
//! through `k` other peers, and if nobody gets an answer within the probe
//! timeout it becomes suspect. A suspect that does not refute the suspicion
//! within the suspicion timeout is declared dead.
//!
//! Changes are disseminated by piggybacking recently changed records on
//! every message the engine sends or replies with.

mod broadcast;
mod engine;
mod messages;
mod probe;

pub(crate) use engine::{Event, GossipEngine, GossipHandle};
pub use messages::{GossipMessage, MessageKind};
