//! Relay
//!
//! Composes the per-key limiter with the dispatch queue and its worker:
//! a submission is first checked against the sender's quota and, if
//! allowed, buffered for background delivery. The limiter and the queue stay
//! independent; the relay only owns them and their background tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{
    BoundedDispatchQueue, Delivery, DispatchError, DispatchItem, DispatchWorker, EnqueueOutcome,
    WorkerError, WorkerHandle, WorkerState, WorkerStats,
};
use crate::metrics;
use crate::rate_limit::{spawn_sweeper, RateLimitDecision, SlidingWindowLimiter};

/// Result of [`Relay::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The item was queued for delivery
    Accepted(EnqueueOutcome),
    /// The key is over quota; nothing was queued
    Throttled { retry_after: Duration },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }
}

/// Running limiter + queue + worker
#[derive(Debug)]
pub struct Relay {
    limiter: Arc<SlidingWindowLimiter>,
    queue: BoundedDispatchQueue,
    worker: WorkerHandle,
    sweeper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    submits: CancellationToken,
    enqueue_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl Relay {
    /// Start a relay from configuration
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config, delivery: Arc<dyn Delivery>) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit));
        Self::start_with_limiter(config, limiter, delivery)
    }

    /// Start a relay around an existing limiter
    pub fn start_with_limiter(
        config: &Config,
        limiter: Arc<SlidingWindowLimiter>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (queue, receiver) = BoundedDispatchQueue::new(config.dispatch.queue_capacity);

        let mut worker = DispatchWorker::new(receiver, delivery).with_cancellation(cancel.child_token());
        if let Some(timeout) = config.dispatch.delivery_timeout() {
            worker = worker.with_delivery_timeout(timeout);
        }
        let worker = worker.spawn();

        let sweeper = config
            .rate_limit
            .sweep_interval()
            .map(|interval| spawn_sweeper(Arc::clone(&limiter), interval, cancel.child_token()));

        info!(
            max_requests = limiter.max_requests(),
            window_ms = limiter.window().as_millis() as u64,
            queue_capacity = queue.capacity(),
            "Relay started"
        );

        Self {
            limiter,
            queue,
            worker,
            sweeper,
            cancel,
            submits: CancellationToken::new(),
            enqueue_timeout: config.dispatch.enqueue_timeout(),
            shutdown_grace: config.dispatch.shutdown_grace(),
        }
    }

    /// Admit and queue one item on behalf of `key`
    ///
    /// A quota slot is consumed as soon as the limiter admits the request,
    /// even if the enqueue then fails. A submission waiting for capacity
    /// returns [`DispatchError::Cancelled`] once the
    /// [`cancellation_token`](Self::cancellation_token) fires.
    pub async fn submit(
        &self,
        key: &str,
        recipient: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<SubmitOutcome, DispatchError> {
        if let RateLimitDecision::Denied { retry_after } = self.limiter.check(key) {
            debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Submission throttled");
            return Ok(SubmitOutcome::Throttled { retry_after });
        }

        let item = DispatchItem::new(recipient, payload);
        let enqueue = self.queue.enqueue_with_cancel(item, &self.submits);
        let outcome = match self.enqueue_timeout {
            Some(timeout) => tokio::time::timeout(timeout, enqueue).await.map_err(|_| {
                metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["timed_out"]).inc();
                DispatchError::TimedOut(timeout)
            })??,
            None => enqueue.await?,
        };
        Ok(SubmitOutcome::Accepted(outcome))
    }

    /// Token that abandons submissions
    ///
    /// Cancelling it makes waiting and later [`submit`](Self::submit) calls
    /// fail with [`DispatchError::Cancelled`]. Items already queued are still
    /// delivered by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.submits.clone()
    }

    /// Shared limiter
    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    /// Producer handle for callers that bypass the limiter
    pub fn queue(&self) -> &BoundedDispatchQueue {
        &self.queue
    }

    /// Worker lifecycle state
    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Close the queue, let the worker drain within the grace period, then
    /// stop the background tasks
    pub async fn shutdown(self) -> Result<WorkerStats, WorkerError> {
        info!(buffered = self.queue.len(), "Relay shutting down");
        self.submits.cancel();
        self.queue.close();

        let result = self.worker.join_or_cancel(self.shutdown_grace).await;
        self.cancel.cancel();

        if let Some(sweeper) = self.sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Rate limit sweeper ended abnormally");
            }
        }

        if let Ok(stats) = &result {
            info!(
                delivered = stats.delivered,
                failed = stats.failed,
                "Relay stopped"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DeliveryError;
    use crate::rate_limit::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn deliver(&self, recipient: &str, payload: &str) -> Result<(), DeliveryError> {
            self.delivered
                .lock()
                .unwrap()
                .push((recipient.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.rate_limit.max_requests = 3;
        config.rate_limit.window_ms = 1000;
        config.dispatch.queue_capacity = 8;
        config
    }

    #[tokio::test]
    async fn test_fourth_submission_is_throttled() {
        let recorder = Arc::new(Recorder::default());
        let relay = Relay::start(&test_config(), recorder.clone());

        let mut outcomes = Vec::new();
        for i in 0..4 {
            outcomes.push(
                relay
                    .submit("user@example.com", "user@example.com", format!("link-{i}"))
                    .await
                    .unwrap(),
            );
        }

        assert!(outcomes[..3].iter().all(SubmitOutcome::is_accepted));
        assert!(matches!(outcomes[3], SubmitOutcome::Throttled { .. }));

        let stats = relay.shutdown().await.unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.failed, 0);

        let delivered = recorder.delivered.lock().unwrap();
        let payloads: Vec<_> = delivered.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(payloads, vec!["link-0", "link-1", "link-2"]);
    }

    #[tokio::test]
    async fn test_keys_are_throttled_independently() {
        let relay = Relay::start(&test_config(), Arc::new(Recorder::default()));

        for _ in 0..3 {
            assert!(relay.submit("a", "a", "p").await.unwrap().is_accepted());
        }
        assert!(!relay.submit("a", "a", "p").await.unwrap().is_accepted());
        assert!(relay.submit("b", "b", "p").await.unwrap().is_accepted());

        let stats = relay.shutdown().await.unwrap();
        assert_eq!(stats.delivered, 4);
    }

    #[tokio::test]
    async fn test_quota_recovers_after_window() {
        let clock = ManualClock::new();
        let limiter = Arc::new(
            SlidingWindowLimiter::new(3, Duration::from_secs(1)).with_clock(Arc::new(clock.clone())),
        );
        let relay = Relay::start_with_limiter(&test_config(), limiter, Arc::new(Recorder::default()));

        for _ in 0..3 {
            relay.submit("k", "r", "p").await.unwrap();
        }
        match relay.submit("k", "r", "p").await.unwrap() {
            SubmitOutcome::Throttled { retry_after } => {
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected throttle, got {other:?}"),
        }

        clock.advance(Duration::from_millis(1001));
        assert!(relay.submit("k", "r", "p").await.unwrap().is_accepted());

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_timeout_applies_when_queue_is_full() {
        // Worker is blocked so the single slot stays occupied
        struct Stuck(tokio::sync::Semaphore);

        #[async_trait]
        impl Delivery for Stuck {
            async fn deliver(&self, _: &str, _: &str) -> Result<(), DeliveryError> {
                let _gate = self.0.acquire().await;
                Ok(())
            }
        }

        let mut config = test_config();
        config.rate_limit.max_requests = 10;
        config.dispatch.queue_capacity = 1;
        config.dispatch.enqueue_timeout_ms = Some(50);
        config.dispatch.shutdown_grace_secs = 0;

        let stuck = Arc::new(Stuck(tokio::sync::Semaphore::new(0)));
        let relay = Relay::start(&config, stuck.clone());

        // First item is taken by the worker, second fills the buffer
        relay.submit("k", "r", "1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.queue().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        relay.submit("k", "r", "2").await.unwrap();

        let err = relay.submit("k", "r", "3").await.unwrap_err();
        assert_eq!(err, DispatchError::TimedOut(Duration::from_millis(50)));

        stuck.0.add_permits(1);
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_submit_on_full_queue() {
        struct Stuck(tokio::sync::Semaphore);

        #[async_trait]
        impl Delivery for Stuck {
            async fn deliver(&self, _: &str, _: &str) -> Result<(), DeliveryError> {
                let _gate = self.0.acquire().await;
                Ok(())
            }
        }

        let mut config = test_config();
        config.rate_limit.max_requests = 10;
        config.dispatch.queue_capacity = 1;
        config.dispatch.shutdown_grace_secs = 5;

        let stuck = Arc::new(Stuck(tokio::sync::Semaphore::new(0)));
        let relay = Relay::start(&config, stuck.clone());

        relay.submit("k", "r", "1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.queue().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        relay.submit("k", "r", "2").await.unwrap();

        let token = relay.cancellation_token();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = tokio::time::timeout(Duration::from_secs(5), relay.submit("k", "r", "3"))
            .await
            .expect("cancelled submit should return")
            .unwrap_err();
        assert_eq!(err, DispatchError::Cancelled);
        canceller.await.unwrap();

        // Later submissions are refused as well, queued ones still deliver
        assert_eq!(
            relay.submit("k", "r", "4").await.unwrap_err(),
            DispatchError::Cancelled
        );
        stuck.0.add_permits(2);
        let stats = relay.shutdown().await.unwrap();
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let mut config = test_config();
        config.rate_limit.enabled = false;
        let relay = Relay::start(&config, Arc::new(Recorder::default()));

        for _ in 0..6 {
            assert!(relay.submit("k", "r", "p").await.unwrap().is_accepted());
        }
        assert_eq!(relay.shutdown().await.unwrap().delivered, 6);
    }
}
