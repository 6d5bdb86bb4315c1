//! Throttle Relay Library
//!
//! Per-key sliding-window rate limiting in front of a bounded background
//! dispatch pipeline: callers ask the limiter whether a key may act, queue
//! an item for delivery, and a single worker hands each item to a pluggable
//! delivery capability (webhook or log-only).

pub mod config;
pub mod dispatch;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod rate_limit;
pub mod relay;

pub use relay::{Relay, SubmitOutcome};
