use rkyv::{Archive, Deserialize, Serialize};

use crate::membership::NodeRecord;

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// The purpose of a gossip message.
pub enum MessageKind {
    /// Sent to seed nodes when joining the cluster.
    Probe,
    /// The reply to a [MessageKind::Probe], the payload holds the full table.
    ProbeAck,
    /// A direct liveness check.
    Ping,
    /// The reply to a ping, or a relayed reply of an indirect ping.
    PingAck,
    /// Asks the receiver to ping the target on behalf of the sender.
    PingReq { target_id: String, target_addr: String },
    /// A push of membership changes, used when leaving the cluster.
    MembershipDelta,
}

#[derive(Serialize, Deserialize, Archive, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
/// A single message of the membership protocol.
///
/// Every message carries the sender's own record plus a bounded batch of
/// recently changed records to piggyback dissemination on probe traffic.
pub struct GossipMessage {
    pub sender: NodeRecord,
    pub kind: MessageKind,
    pub payload: Vec<NodeRecord>,
}

impl GossipMessage {
    pub fn new(sender: NodeRecord, kind: MessageKind, payload: Vec<NodeRecord>) -> Self {
        Self {
            sender,
            kind,
            payload,
        }
    }
}
