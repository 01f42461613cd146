use std::collections::VecDeque;

/// The number of times a single change is piggybacked onto outgoing messages.
///
/// This is `multiplier * ceil(log2(n + 1))` for a cluster of `n` members,
/// enough for the change to reach every member with high probability.
pub fn retransmit_limit(multiplier: usize, num_members: usize) -> usize {
    let log = (usize::BITS - num_members.leading_zeros()) as usize;
    multiplier * log.max(1)
}

#[derive(Debug, Default)]
/// The queue of membership changes waiting to be disseminated.
///
/// Only member ids are queued, the current record of the member is read
/// when the message is built so the newest state is always sent.
pub struct BroadcastQueue {
    pending: VecDeque<(String, usize)>,
}

impl BroadcastQueue {
    /// Queues a changed member, resetting its transmission count.
    ///
    /// New changes are sent before older ones.
    pub fn push(&mut self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        self.pending.retain(|(id, _)| id != &node_id);
        self.pending.push_front((node_id, 0));
    }

    /// Drops a member from the queue.
    pub fn remove(&mut self, node_id: &str) {
        self.pending.retain(|(id, _)| id != node_id);
    }

    /// Selects up to `limit` members to attach to the next message.
    ///
    /// Selected members move to the back of the queue and are dropped once
    /// they have been sent `max_transmissions` times.
    pub fn select(&mut self, limit: usize, max_transmissions: usize) -> Vec<String> {
        let n = limit.min(self.pending.len());
        let mut selected = Vec::with_capacity(n);

        for _ in 0..n {
            let Some((node_id, sent)) = self.pending.pop_front() else {
                break;
            };

            selected.push(node_id.clone());
            if sent + 1 < max_transmissions {
                self.pending.push_back((node_id, sent + 1));
            }
        }

        selected
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_limit() {
        assert_eq!(retransmit_limit(4, 0), 4);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 3), 8);
        assert_eq!(retransmit_limit(4, 4), 12);
        assert_eq!(retransmit_limit(3, 100), 21);
    }

    #[test]
    fn test_round_robin_selection() {
        let mut queue = BroadcastQueue::default();
        queue.push("a");
        queue.push("b");
        queue.push("c");

        // Newest first.
        assert_eq!(queue.select(2, 2), vec!["c", "b"]);
        assert_eq!(queue.select(2, 2), vec!["a", "c"]);
        assert_eq!(queue.select(2, 2), vec!["b", "a"]);
        assert!(queue.is_empty(), "Every change has been sent twice.");
    }

    #[test]
    fn test_push_resets_count() {
        let mut queue = BroadcastQueue::default();
        queue.push("a");
        assert_eq!(queue.select(1, 2), vec!["a"]);

        queue.push("a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.select(1, 2), vec!["a"]);
        assert_eq!(queue.select(1, 2), vec!["a"]);
        assert!(queue.is_empty());

        queue.push("b");
        queue.remove("b");
        assert!(queue.is_empty());
    }
}
