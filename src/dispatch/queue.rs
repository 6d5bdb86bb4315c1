//! Bounded Dispatch Queue
//!
//! Multi-producer, single-consumer queue with backpressure. Producers that
//! find the queue full are suspended on a fair semaphore until the consumer
//! frees a slot; items reach the consumer in the order they were accepted.
//!
//! Closing the queue rejects new and waiting producers with
//! [`DispatchError::Closed`], while the consumer still drains everything
//! already buffered before it sees end-of-stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::DispatchError;
use super::item::{DispatchItem, QueuedItem};
use crate::metrics;

/// Default number of items the queue may hold
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Largest capacity the slot semaphore can represent
pub const MAX_QUEUE_CAPACITY: usize = Semaphore::MAX_PERMITS;

// The buffer grows on demand past this
const INITIAL_BUFFER: usize = 1024;

/// Successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted without waiting
    Accepted { seq: u64 },
    /// Accepted after the producer was suspended on a full queue
    AcceptedAfterWait { seq: u64, waited: Duration },
}

impl EnqueueOutcome {
    /// Acceptance sequence number of the item
    pub fn seq(&self) -> u64 {
        match self {
            EnqueueOutcome::Accepted { seq } | EnqueueOutcome::AcceptedAfterWait { seq, .. } => *seq,
        }
    }

    /// Whether the producer had to wait for capacity
    pub fn was_suspended(&self) -> bool {
        matches!(self, EnqueueOutcome::AcceptedAfterWait { .. })
    }
}

#[derive(Debug)]
struct Buffer {
    items: VecDeque<QueuedItem>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<Buffer>,
    /// One permit per free slot
    slots: Semaphore,
    item_ready: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if this call closed the queue
    fn close(&self) -> bool {
        let newly_closed = {
            let mut buffer = self.lock();
            !std::mem::replace(&mut buffer.closed, true)
        };

        if newly_closed {
            self.slots.close();
            self.item_ready.notify_one();
        }
        newly_closed
    }
}

/// Producer handle; clone it freely across tasks
#[derive(Debug, Clone)]
pub struct BoundedDispatchQueue {
    shared: Arc<Shared>,
}

impl BoundedDispatchQueue {
    /// Create a queue holding at most `capacity` items, returning the
    /// producer handle and the only consumer handle.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or above [`MAX_QUEUE_CAPACITY`].
    pub fn new(capacity: usize) -> (Self, DispatchReceiver) {
        assert!(capacity > 0, "capacity must be positive");
        assert!(
            capacity <= MAX_QUEUE_CAPACITY,
            "capacity must not exceed {MAX_QUEUE_CAPACITY}"
        );

        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                items: VecDeque::with_capacity(capacity.min(INITIAL_BUFFER)),
                next_seq: 0,
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            item_ready: Notify::new(),
            capacity,
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            DispatchReceiver { shared },
        )
    }

    /// Enqueue an item, waiting for capacity if the queue is full
    pub async fn enqueue(&self, item: DispatchItem) -> Result<EnqueueOutcome, DispatchError> {
        let waited = match self.shared.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                None
            }
            Err(TryAcquireError::Closed) => return Err(reject_closed()),
            Err(TryAcquireError::NoPermits) => {
                debug!(capacity = self.shared.capacity, "Dispatch queue full, producer waiting");
                let started = Instant::now();
                let permit = self
                    .shared
                    .slots
                    .acquire()
                    .await
                    .map_err(|_| reject_closed())?;
                permit.forget();
                let waited = started.elapsed();
                metrics::DISPATCH_ENQUEUE_WAIT_SECONDS.observe(waited.as_secs_f64());
                Some(waited)
            }
        };

        self.push(item, waited)
    }

    /// Convenience wrapper around [`enqueue`](Self::enqueue)
    pub async fn enqueue_item(
        &self,
        recipient: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<EnqueueOutcome, DispatchError> {
        self.enqueue(DispatchItem::new(recipient, payload)).await
    }

    /// Enqueue, giving up with [`DispatchError::Cancelled`] if `cancel` fires
    /// first
    pub async fn enqueue_with_cancel(
        &self,
        item: DispatchItem,
        cancel: &CancellationToken,
    ) -> Result<EnqueueOutcome, DispatchError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["cancelled"]).inc();
                Err(DispatchError::Cancelled)
            }
            result = self.enqueue(item) => result,
        }
    }

    /// Enqueue, giving up with [`DispatchError::TimedOut`] after `timeout`
    pub async fn enqueue_timeout(
        &self,
        item: DispatchItem,
        timeout: Duration,
    ) -> Result<EnqueueOutcome, DispatchError> {
        match tokio::time::timeout(timeout, self.enqueue(item)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["timed_out"]).inc();
                Err(DispatchError::TimedOut(timeout))
            }
        }
    }

    /// Enqueue without waiting; fails with [`DispatchError::Full`] at capacity
    pub fn try_enqueue(&self, item: DispatchItem) -> Result<EnqueueOutcome, DispatchError> {
        match self.shared.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push(item, None)
            }
            Err(TryAcquireError::Closed) => Err(reject_closed()),
            Err(TryAcquireError::NoPermits) => {
                metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["full"]).inc();
                Err(DispatchError::Full(self.shared.capacity))
            }
        }
    }

    /// Stop accepting items. Buffered items are still delivered.
    pub fn close(&self) {
        if self.shared.close() {
            info!(buffered = self.len(), "Dispatch queue closed");
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered items
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Place an item for which a slot permit has already been taken
    fn push(&self, item: DispatchItem, waited: Option<Duration>) -> Result<EnqueueOutcome, DispatchError> {
        let seq = {
            let mut buffer = self.shared.lock();
            if buffer.closed {
                drop(buffer);
                self.shared.slots.add_permits(1);
                return Err(reject_closed());
            }

            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.items.push_back(QueuedItem {
                seq,
                accepted_at: Instant::now(),
                item,
            });
            metrics::DISPATCH_QUEUE_DEPTH.set(buffer.items.len() as i64);
            seq
        };
        self.shared.item_ready.notify_one();

        let outcome = match waited {
            None => EnqueueOutcome::Accepted { seq },
            Some(waited) => EnqueueOutcome::AcceptedAfterWait { seq, waited },
        };
        debug!(seq, suspended = outcome.was_suspended(), "Item enqueued");
        metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["accepted"]).inc();
        Ok(outcome)
    }
}

fn reject_closed() -> DispatchError {
    metrics::DISPATCH_ENQUEUED_TOTAL.with_label_values(&["closed"]).inc();
    DispatchError::Closed
}

enum Pop {
    Item(QueuedItem),
    Empty,
    Drained,
}

/// Consumer handle. Dropping it closes the queue.
#[derive(Debug)]
pub struct DispatchReceiver {
    shared: Arc<Shared>,
}

impl DispatchReceiver {
    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn recv(&mut self) -> Option<QueuedItem> {
        loop {
            match self.pop() {
                Pop::Item(queued) => return Some(queued),
                Pop::Drained => return None,
                Pop::Empty => {}
            }
            self.shared.item_ready.notified().await;
        }
    }

    /// Take the next item if one is buffered
    pub fn try_recv(&mut self) -> Option<QueuedItem> {
        match self.pop() {
            Pop::Item(queued) => Some(queued),
            Pop::Empty | Pop::Drained => None,
        }
    }

    /// Close the queue from the consumer side
    pub fn close(&self) {
        if self.shared.close() {
            info!("Dispatch queue closed by consumer");
        }
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&mut self) -> Pop {
        let mut buffer = self.shared.lock();
        match buffer.items.pop_front() {
            Some(queued) => {
                metrics::DISPATCH_QUEUE_DEPTH.set(buffer.items.len() as i64);
                drop(buffer);
                self.shared.slots.add_permits(1);
                debug!(seq = queued.seq, "Item dequeued");
                Pop::Item(queued)
            }
            None if buffer.closed => Pop::Drained,
            None => Pop::Empty,
        }
    }
}

impl Drop for DispatchReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
