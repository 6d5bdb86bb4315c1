//! Attempt Guard
//!
//! Lockout policy for sensitive flows such as password resets. Attempts per
//! key are counted over a sliding window; the attempt that uses up the quota
//! triggers a [`LockoutAction`] once, and later attempts in the same window
//! are refused without firing it again.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};
use super::config::AttemptConfig;
use super::limiter::{RateLimitDecision, SlidingWindowLimiter};
use crate::metrics;

/// Side effect run when a key exhausts its attempts
pub trait LockoutAction: Send + Sync {
    /// Called once per window for the key that just got locked out
    fn on_locked_out(&self, key: &str);
}

/// Lockout action that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLockout;

impl LockoutAction for LogLockout {
    fn on_locked_out(&self, key: &str) {
        warn!(key, "Attempt limit reached, key locked out");
    }
}

/// Result of recording an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Attempt counted; `remaining` more are allowed in this window
    Permitted { remaining: u32 },
    /// This attempt used the last slot and the lockout action ran
    LockedOutNow,
    /// Key is already locked out; try again after `retry_after`
    LockedOut { retry_after: Duration },
}

impl AttemptOutcome {
    /// Whether the caller may proceed with this attempt
    pub fn is_permitted(&self) -> bool {
        !matches!(self, AttemptOutcome::LockedOut { .. })
    }
}

/// Per-key attempt counter with a lockout side effect
///
/// A lockout lasts one full window from the attempt that triggered it, even
/// if older attempts age out of the log in the meantime.
pub struct AttemptGuard {
    limiter: SlidingWindowLimiter,
    lockouts: DashMap<String, Instant>,
    window: Duration,
    clock: Arc<dyn Clock>,
    action: Arc<dyn LockoutAction>,
}

impl AttemptGuard {
    /// Create a guard allowing `max_attempts` per key within `window`
    pub fn new(max_attempts: u32, window: Duration, action: Arc<dyn LockoutAction>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(max_attempts, window).with_name("attempts"),
            lockouts: DashMap::new(),
            window,
            clock: Arc::new(SystemClock::new()),
            action,
        }
    }

    /// Create a guard from configuration
    pub fn from_config(config: &AttemptConfig, action: Arc<dyn LockoutAction>) -> Self {
        Self::new(config.max_attempts, config.window(), action)
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = self.limiter.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Record one attempt for `key`.
    ///
    /// The attempt that exhausts the quota is still permitted; it returns
    /// [`AttemptOutcome::LockedOutNow`] after the lockout action has run.
    /// Attempts made while locked out are refused and not counted.
    pub fn record_attempt(&self, key: &str) -> AttemptOutcome {
        if let Some(retry_after) = self.lockout_remaining(key) {
            return AttemptOutcome::LockedOut { retry_after };
        }

        match self.limiter.check(key) {
            RateLimitDecision::Allowed { remaining: 0 } => {
                // Only the caller that inserts the lockout runs the action
                let locked_at = self.clock.now();
                if self.lockouts.insert(key.to_owned(), locked_at).is_some() {
                    return AttemptOutcome::LockedOut {
                        retry_after: self.window,
                    };
                }
                info!(key, "Attempt quota exhausted");
                metrics::ATTEMPT_LOCKOUTS_TOTAL.inc();
                self.action.on_locked_out(key);
                AttemptOutcome::LockedOutNow
            }
            RateLimitDecision::Allowed { remaining } => AttemptOutcome::Permitted { remaining },
            RateLimitDecision::Denied { retry_after } => AttemptOutcome::LockedOut { retry_after },
        }
    }

    /// Time left on an active lockout; clears an expired one
    fn lockout_remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let locked_at = *self.lockouts.get(key)?;
        let elapsed = now.duration_since(locked_at);
        if elapsed <= self.window {
            return Some((self.window - elapsed).max(Duration::from_nanos(1)));
        }
        self.lockouts
            .remove_if(key, |_, at| now.duration_since(*at) > self.window);
        None
    }

    /// Whether `key` is currently locked out
    pub fn is_locked_out(&self, key: &str) -> bool {
        self.lockout_remaining(key).is_some()
    }

    /// Attempts left for `key` in the current window
    pub fn remaining(&self, key: &str) -> u32 {
        if self.is_locked_out(key) {
            return 0;
        }
        self.limiter.remaining(key)
    }

    /// Forget all attempts and any lockout for `key`, e.g. after a
    /// successful reset
    pub fn clear(&self, key: &str) {
        self.limiter.reset(key);
        self.lockouts.remove(key);
    }

    /// Drop counters and lockouts that have fully aged out
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        self.lockouts
            .retain(|_, at| now.duration_since(*at) <= self.window);
        self.limiter.sweep_expired()
    }
}
