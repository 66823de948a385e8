//! Cancellable waits for retry loops.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `shutdown` fires first. Returns `false` when
/// the wait was cut short.
pub async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}
