mod addr;

use std::future::Future;
use std::time::Duration;

pub use addr::{get_unused_addr, get_unused_addrs};

/// Installs the test log subscriber, if one is not already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Polls the given condition until it holds or the timeout elapses.
///
/// Returns if the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
