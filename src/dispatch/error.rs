//! Dispatch Error Types
//!
//! Errors returned to producers, raised by delivery capabilities, and
//! surfaced when the worker loop itself dies.

use std::time::Duration;

/// Why an item could not be enqueued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The queue was closed before the item was accepted
    #[error("Dispatch queue is closed")]
    Closed,

    /// The queue is at capacity (non-blocking enqueue only)
    #[error("Dispatch queue is full ({0} items)")]
    Full(usize),

    /// The producer gave up waiting for capacity
    #[error("Enqueue cancelled while waiting for capacity")]
    Cancelled,

    /// No capacity became available within the deadline
    #[error("Enqueue timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failure reported by a delivery capability
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The remote side answered with a non-success status
    #[error("Delivery rejected with HTTP {status}")]
    Rejected { status: u16 },

    /// The request never got a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Delivery exceeded its time budget
    #[error("Delivery timed out after {0:?}")]
    TimedOut(Duration),

    /// Delivery task panicked
    #[error("Delivery panicked: {0}")]
    Panicked(String),

    /// Any other delivery failure
    #[error("Delivery failed: {0}")]
    Other(#[source] anyhow::Error),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            DeliveryError::Rejected {
                status: status.as_u16(),
            }
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }
}

/// Fatal failure of the worker loop
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker task panicked outside of a delivery
    #[error("Dispatch worker crashed: {0}")]
    Crashed(String),

    /// The worker task was aborted before it could stop cleanly
    #[error("Dispatch worker was aborted")]
    Aborted,
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            WorkerError::Crashed(panic_message(e.into_panic()))
        } else {
            WorkerError::Aborted
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
