use std::cmp;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Maximum physical clock drift allowed, in ms
const MAX_DRIFT_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("The remote version is {drift_ms}ms ahead of the local clock.")]
/// A remote version is too far in the future to be folded into the clock.
pub struct ClockDrift {
    pub drift_ms: u64,
}

#[derive(
    Serialize, Deserialize, Archive, Debug, Copy, Clone, Eq, PartialEq, Hash, Default,
)]
#[archive(check_bytes)]
/// The version of a cache entry.
///
/// Versions are hybrid logical clock timestamps. They are ordered by
/// `(millis, counter, node)` so two writers can never produce equal
/// versions for different values, the writer's node hash breaks the tie.
pub struct Version {
    millis: u64,
    counter: u16,
    node: u32,
}

impl PartialOrd<Self> for Version {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        (self.millis, self.counter, self.node).cmp(&(
            other.millis,
            other.counter,
            other.node,
        ))
    }
}

impl Version {
    pub fn new(millis: u64, counter: u16, node: u32) -> Self {
        Self {
            millis,
            counter,
            node,
        }
    }

    #[inline]
    pub fn node(&self) -> u32 {
        self.node
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:0>4X}-{}", self.millis, self.counter, self.node)
    }
}

#[derive(Clone)]
/// The node's version clock.
///
/// Issues strictly increasing versions and folds in versions observed
/// from other nodes so later local writes order after them.
pub struct Clock {
    node: u32,
    state: Arc<Mutex<(u64, u16)>>,
}

impl Clock {
    /// Creates a new clock for the given node id.
    pub fn new(node_id: &str) -> Self {
        Self {
            node: crc32fast::hash(node_id.as_bytes()),
            state: Arc::new(Mutex::new((0, 0))),
        }
    }

    #[inline]
    /// The hash of the node id stamped on every version.
    pub fn node(&self) -> u32 {
        self.node
    }

    /// Produces the next version.
    pub fn next(&self) -> Version {
        let now = get_unix_timestamp_ms();
        let mut state = self.state.lock();
        let (millis, counter) = *state;

        // The logical time never goes backwards, when the physical
        // time has not advanced the counter is bumped instead.
        let (millis, counter) = match now.cmp(&millis) {
            cmp::Ordering::Greater => (now, 0),
            _ => match counter.checked_add(1) {
                Some(counter) => (millis, counter),
                None => (millis + 1, 0),
            },
        };

        *state = (millis, counter);
        Version::new(millis, counter, self.node)
    }

    /// Folds a version produced by another node into the clock.
    pub fn observe(&self, remote: Version) -> Result<(), ClockDrift> {
        if remote.node == self.node {
            return Ok(());
        }

        let now = get_unix_timestamp_ms();
        let drift_ms = remote.millis.saturating_sub(now);
        if drift_ms > MAX_DRIFT_MS {
            return Err(ClockDrift { drift_ms });
        }

        let mut state = self.state.lock();
        if (remote.millis, remote.counter) > *state {
            *state = (remote.millis, remote.counter);
        }

        Ok(())
    }
}

pub fn get_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
