//! Dispatch Worker
//!
//! Single consumer draining a [`DispatchReceiver`]. Each item is delivered in
//! its own task so that an error, a panic or a hang (with a delivery timeout
//! set) affects only that item. The loop itself only stops when it is
//! cancelled while waiting, or when the queue is closed and drained.
//!
//! ```text
//! Idle ──► Waiting ──► Processing ──► Idle ...
//!             │
//!             └──► Stopped  (cancelled, or queue closed and empty)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::Delivery;
use super::error::{panic_message, DeliveryError, WorkerError};
use super::item::QueuedItem;
use super::queue::DispatchReceiver;
use crate::metrics;

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Waiting,
    Processing,
    Stopped,
}

/// Counters reported when the worker stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: u64,
    pub failed: u64,
}

impl WorkerStats {
    /// Items taken off the queue
    pub fn processed(&self) -> u64 {
        self.delivered + self.failed
    }
}

/// Consumer loop over a dispatch queue
pub struct DispatchWorker {
    receiver: DispatchReceiver,
    delivery: Arc<dyn Delivery>,
    delivery_timeout: Option<Duration>,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl DispatchWorker {
    /// Create a worker delivering items from `receiver` through `delivery`
    pub fn new(receiver: DispatchReceiver, delivery: Arc<dyn Delivery>) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            receiver,
            delivery,
            delivery_timeout: None,
            cancel: CancellationToken::new(),
            state,
            stats: WorkerStats::default(),
        }
    }

    /// Fail deliveries that take longer than `timeout`
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = Some(timeout);
        self
    }

    /// Stop when `cancel` fires (e.g. a child of a process-wide token)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the loop on a new task
    pub fn spawn(self) -> WorkerHandle {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let join = tokio::spawn(self.run());
        WorkerHandle {
            join,
            cancel,
            state,
        }
    }

    /// Run the loop on the current task until cancelled or drained
    pub async fn run(mut self) -> WorkerStats {
        info!("Dispatch worker started");

        loop {
            self.state.send_replace(WorkerState::Waiting);

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(buffered = self.receiver.len(), "Dispatch worker cancelled");
                    break;
                }
                next = self.receiver.recv() => next,
            };

            let Some(queued) = next else {
                info!("Dispatch queue drained, worker stopping");
                break;
            };

            self.state.send_replace(WorkerState::Processing);
            self.process(queued).await;
            self.state.send_replace(WorkerState::Idle);
        }

        self.state.send_replace(WorkerState::Stopped);
        info!(
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            "Dispatch worker stopped"
        );
        self.stats
    }

    async fn process(&mut self, queued: QueuedItem) {
        let seq = queued.seq;
        debug!(
            seq,
            queued_ms = queued.accepted_at.elapsed().as_millis() as u64,
            "Delivering item"
        );

        let delivery = Arc::clone(&self.delivery);
        let timeout = self.delivery_timeout;
        let start = Instant::now();

        let task = tokio::spawn(async move {
            let item = queued.item;
            let attempt = delivery.deliver(item.recipient(), item.payload());
            match timeout {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .unwrap_or(Err(DeliveryError::TimedOut(limit))),
                None => attempt.await,
            }
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(DeliveryError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(DeliveryError::Other(anyhow::anyhow!(e))),
        };
        metrics::DISPATCH_DELIVERY_DURATION_SECONDS.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.stats.delivered += 1;
                metrics::DISPATCH_DELIVERIES_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                debug!(seq, "Item delivered");
            }
            Err(e) => {
                self.stats.failed += 1;
                metrics::DISPATCH_DELIVERIES_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                warn!(seq, error = %e, "Delivery failed, item discarded");
            }
        }
    }
}

/// Handle to a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    join: JoinHandle<WorkerStats>,
    cancel: CancellationToken,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Current state of the loop
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `target`
    pub async fn wait_for_state(&mut self, target: WorkerState) {
        // A closed channel means the worker is gone
        let _ = self.state.wait_for(|state| *state == target).await;
    }

    /// Ask the loop to stop at its next wait; an in-flight delivery finishes
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this worker
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to exit
    pub async fn join(self) -> Result<WorkerStats, WorkerError> {
        self.join.await.map_err(|e| {
            let err = WorkerError::from(e);
            error!(error = %err, "Dispatch worker failed");
            err
        })
    }

    /// Wait up to `grace` for the worker to exit on its own, then cancel it
    pub async fn join_or_cancel(mut self, grace: Duration) -> Result<WorkerStats, WorkerError> {
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(result) => result.map_err(WorkerError::from),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Worker did not drain in time, cancelling");
                self.cancel();
                self.join().await
            }
        }
    }

    /// Cancel and wait
    pub async fn shutdown(self) -> Result<WorkerStats, WorkerError> {
        self.cancel();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::BoundedDispatchQueue;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call; fails or panics for selected recipients
    #[derive(Default)]
    struct ScriptedDelivery {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Vec<&'static str>,
        panic_on: Vec<&'static str>,
        hang_on: Vec<&'static str>,
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn deliver(&self, recipient: &str, payload: &str) -> Result<(), DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((recipient.to_string(), payload.to_string()));
            if self.panic_on.iter().any(|r| *r == recipient) {
                panic!("delivery exploded for {recipient}");
            }
            if self.hang_on.iter().any(|r| *r == recipient) {
                std::future::pending::<()>().await;
            }
            if self.fail_on.iter().any(|r| *r == recipient) {
                return Err(DeliveryError::Rejected { status: 500 });
            }
            Ok(())
        }
    }

    fn recipients(delivery: &ScriptedDelivery) -> Vec<String> {
        delivery
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_items() {
        let (queue, rx) = BoundedDispatchQueue::new(10);
        let delivery = Arc::new(ScriptedDelivery {
            fail_on: vec!["B"],
            ..Default::default()
        });
        let handle = DispatchWorker::new(rx, delivery.clone()).spawn();

        for name in ["A", "B", "C"] {
            queue.enqueue_item(name, "payload").await.unwrap();
        }
        queue.close();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats, WorkerStats { delivered: 2, failed: 1 });
        assert_eq!(recipients(&delivery), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_panicking_delivery_is_contained() {
        let (queue, rx) = BoundedDispatchQueue::new(10);
        let delivery = Arc::new(ScriptedDelivery {
            panic_on: vec!["B"],
            ..Default::default()
        });
        let handle = DispatchWorker::new(rx, delivery.clone()).spawn();

        for name in ["A", "B", "C"] {
            queue.enqueue_item(name, "payload").await.unwrap();
        }
        queue.close();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(recipients(&delivery), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_delivery_times_out() {
        let (queue, rx) = BoundedDispatchQueue::new(10);
        let delivery = Arc::new(ScriptedDelivery {
            hang_on: vec!["slow"],
            ..Default::default()
        });
        let handle = DispatchWorker::new(rx, delivery.clone())
            .with_delivery_timeout(Duration::from_secs(5))
            .spawn();

        queue.enqueue_item("slow", "x").await.unwrap();
        queue.enqueue_item("fast", "y").await.unwrap();
        queue.close();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats, WorkerStats { delivered: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_payload_reaches_delivery_unchanged() {
        let (queue, rx) = BoundedDispatchQueue::new(4);
        let delivery = Arc::new(ScriptedDelivery::default());
        let handle = DispatchWorker::new(rx, delivery.clone()).spawn();

        let payload = "https://example.com/verify?token=Zm9v&next=%2Fhome  ";
        queue.enqueue_item("User@Example.com", payload).await.unwrap();
        queue.close();
        handle.join().await.unwrap();

        assert_eq!(
            *delivery.calls.lock().unwrap(),
            vec![("User@Example.com".to_string(), payload.to_string())]
        );
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_stops_worker() {
        let (queue, rx) = BoundedDispatchQueue::new(4);
        let delivery = Arc::new(ScriptedDelivery::default());
        let mut handle = DispatchWorker::new(rx, delivery).spawn();

        handle.wait_for_state(WorkerState::Waiting).await;
        handle.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("worker should stop promptly")
            .unwrap();
        assert_eq!(stats.processed(), 0);

        // Receiver dropped with the worker, so producers see a closed queue
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_in_flight_delivery_finishes_before_stop() {
        struct Gated {
            entered: tokio::sync::Notify,
            release: tokio::sync::Notify,
            done: Mutex<bool>,
        }

        #[async_trait]
        impl Delivery for Gated {
            async fn deliver(&self, _recipient: &str, _payload: &str) -> Result<(), DeliveryError> {
                self.entered.notify_one();
                self.release.notified().await;
                *self.done.lock().unwrap() = true;
                Ok(())
            }
        }

        let (queue, rx) = BoundedDispatchQueue::new(4);
        let gated = Arc::new(Gated {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            done: Mutex::new(false),
        });
        let handle = DispatchWorker::new(rx, gated.clone()).spawn();

        queue.enqueue_item("r", "p").await.unwrap();
        gated.entered.notified().await;
        assert_eq!(handle.state(), WorkerState::Processing);

        handle.cancel();
        gated.release.notify_one();

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert!(*gated.done.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_or_cancel_cancels_after_grace() {
        let (queue, rx) = BoundedDispatchQueue::new(4);
        let handle = DispatchWorker::new(rx, Arc::new(ScriptedDelivery::default())).spawn();

        // Queue never closed, so the worker would wait forever
        let stats = handle
            .join_or_cancel(Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(stats.processed(), 0);
        drop(queue);
    }

    #[tokio::test]
    async fn test_state_reaches_stopped() {
        let (queue, rx) = BoundedDispatchQueue::new(1);
        let mut handle = DispatchWorker::new(rx, Arc::new(ScriptedDelivery::default())).spawn();

        queue.close();
        handle.wait_for_state(WorkerState::Stopped).await;
        assert_eq!(handle.state(), WorkerState::Stopped);
        handle.join().await.unwrap();
    }
}
