use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::router::Router;
use crate::storage::LocalStore;

/// Removes expired entries from the local store every `period`.
pub(crate) async fn expiry_sweeper_task<S>(
    node_id: String,
    store: Arc<S>,
    period: Duration,
    kill_switch: Arc<AtomicBool>,
) where
    S: LocalStore,
{
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        let start = Instant::now();
        match store.purge_expired().await {
            Ok(0) => {},
            Ok(num_purged) => trace!(
                node_id = %node_id,
                num_purged = num_purged,
                time_taken = ?start.elapsed(),
                "Purged expired entries from store."
            ),
            Err(e) => warn!(
                node_id = %node_id,
                error = ?e,
                "Failed to purge expired entries from store."
            ),
        }
    }
}

/// Hands entries this node no longer owns over to their new owners
/// every `period`.
pub(crate) async fn handoff_task<S>(
    node_id: String,
    router: Router<S>,
    period: Duration,
    kill_switch: Arc<AtomicBool>,
) where
    S: LocalStore,
{
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        let start = Instant::now();
        match router.handoff_unowned().await {
            Ok(0) => {},
            Ok(num_moved) => info!(
                node_id = %node_id,
                num_moved = num_moved,
                time_taken = ?start.elapsed(),
                "Handed entries over to their new owners."
            ),
            Err(e) => warn!(
                node_id = %node_id,
                error = ?e,
                "Failed to hand entries over to their new owners."
            ),
        }
    }
}
