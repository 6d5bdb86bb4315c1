//! Rate Limiting Module
//!
//! Per-key admission control over a rolling time window.
//!
//! # Features
//!
//! - Sliding-window log per key, linearizable per key
//! - Injectable clock for deterministic tests
//! - Exempt keys and a global on/off switch
//! - Attempt guard with a one-shot lockout action
//! - Background sweeper bounding memory for idle keys
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SlidingWindowLimiter                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DashMap<key, Bucket { VecDeque<Instant> }>   ◄── Clock     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  AttemptGuard (lockout hook) │  Sweeper (periodic eviction) │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```

pub mod attempts;
pub mod clock;
pub mod config;
pub mod limiter;
pub mod sweeper;

pub use attempts::{AttemptGuard, AttemptOutcome, LockoutAction, LogLockout};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AttemptConfig, RateLimitConfig};
pub use limiter::{RateLimitDecision, SlidingWindowLimiter};
pub use sweeper::spawn_sweeper;
