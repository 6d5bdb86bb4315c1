// Background eviction of idle rate limit buckets
//
// Buckets are created lazily per key and never removed by `check`, so a
// long-running process would otherwise keep one bucket per key it has ever
// seen. The sweeper periodically drops buckets whose slots have all expired.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::limiter::SlidingWindowLimiter;
use crate::metrics;

/// Spawn a task sweeping `limiter` every `interval` until `cancel` fires
pub fn spawn_sweeper(
    limiter: Arc<SlidingWindowLimiter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Rate limit sweeper started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = limiter.sweep_expired();
                    let tracked = limiter.tracked_keys();
                    metrics::RATE_LIMIT_EVICTED_KEYS_TOTAL.inc_by(evicted as u64);
                    metrics::RATE_LIMIT_TRACKED_KEYS.set(tracked as i64);
                    if evicted > 0 {
                        debug!(evicted, tracked, "Swept idle rate limit buckets");
                    }
                }
            }
        }

        info!("Rate limit sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_expired_buckets() {
        let clock = ManualClock::new();
        let limiter = Arc::new(
            SlidingWindowLimiter::new(3, Duration::from_secs(1)).with_clock(Arc::new(clock.clone())),
        );
        let cancel = CancellationToken::new();

        assert!(limiter.try_consume("a"));
        assert!(limiter.try_consume("b"));
        assert_eq!(limiter.tracked_keys(), 2);

        let handle = spawn_sweeper(limiter.clone(), Duration::from_secs(30), cancel.clone());

        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let limiter = Arc::new(SlidingWindowLimiter::new(1, Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(limiter, Duration::from_secs(60), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
