// Background dispatch pipeline
//
// Handles:
// - Bounded multi-producer queue with backpressure and close/drain
// - Single consumer worker with per-item failure isolation
// - Pluggable delivery capabilities (webhook, dry-run log)

pub mod delivery;
pub mod error;
pub mod item;
pub mod queue;
pub mod worker;

pub use delivery::{Delivery, DeliveryConfig, LogDelivery, WebhookDelivery};
pub use error::{DeliveryError, DispatchError, WorkerError};
pub use item::{DispatchItem, QueuedItem};
pub use queue::{
    BoundedDispatchQueue, DispatchReceiver, EnqueueOutcome, DEFAULT_QUEUE_CAPACITY,
    MAX_QUEUE_CAPACITY,
};
pub use worker::{DispatchWorker, WorkerHandle, WorkerState, WorkerStats};
