//! Cooperative pacing for large fan-outs.

use std::time::Duration;

/// Split `items` into batches of `size` (at least one item per batch).
pub fn batches<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Yield to the scheduler, then wait `stagger` if it is non-zero.
///
/// Called between two batches so one alert's fan-out never holds the worker
/// for more than a batch at a time.
pub async fn pause_between_batches(stagger: Duration) {
    tokio::task::yield_now().await;
    if !stagger.is_zero() {
        tokio::time::sleep(stagger).await;
    }
}
