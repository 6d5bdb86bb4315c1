//! Sliding-Window Limiter
//!
//! Per-key sliding-window log. Every key owns a bucket holding the instants
//! of its accepted requests; a request is admitted while fewer than
//! `max_requests` of those instants fall inside the trailing window.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::config::RateLimitConfig;
use crate::metrics;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request admitted; `remaining` slots are still free in the window
    Allowed { remaining: u32 },
    /// Request rejected; the oldest slot frees after `retry_after`
    Denied { retry_after: Duration },
}

impl RateLimitDecision {
    /// Whether the request was admitted
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// Suggested wait before retrying, for denied requests
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allowed { .. } => None,
            RateLimitDecision::Denied { retry_after } => Some(*retry_after),
        }
    }
}

/// Smallest retry hint handed out on a denial
const MIN_RETRY_AFTER: Duration = Duration::from_nanos(1);

/// Accepted-request instants for one key, oldest first
#[derive(Debug, Default)]
struct Bucket {
    slots: VecDeque<Instant>,
}

impl Bucket {
    /// Drop slots strictly older than `now - window`
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.slots.front() {
            if now.duration_since(oldest) > window {
                self.slots.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> u32 {
        self.slots.len() as u32
    }
}

/// Thread-safe per-key sliding-window rate limiter
///
/// Buckets live in a sharded map, so calls for unrelated keys rarely contend
/// and calls for the same key are serialized by the shard lock.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: &'static str,
    buckets: DashMap<String, Bucket>,
    max_requests: u32,
    window: Duration,
    enabled: bool,
    exempt_keys: HashSet<String>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `max_requests` per key within `window`.
    ///
    /// # Panics
    ///
    /// Panics if `max_requests` is zero or `window` is zero.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        assert!(max_requests > 0, "max_requests must be positive");
        assert!(!window.is_zero(), "window must be positive");

        Self {
            name: "default",
            buckets: DashMap::new(),
            max_requests,
            window,
            enabled: true,
            exempt_keys: HashSet::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Create a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(config.max_requests, config.window())
            .with_exempt_keys(config.exempt_keys.iter().cloned());
        limiter.enabled = config.enabled;
        limiter
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Label used for this limiter's metrics
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Keys that bypass the limiter entirely
    pub fn with_exempt_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.exempt_keys.extend(keys);
        self
    }

    /// Record one request for `key` if the quota allows it.
    ///
    /// Returns `false` without recording anything when the key already has
    /// `max_requests` accepted requests inside the trailing window.
    pub fn try_consume(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Same decision as [`try_consume`](Self::try_consume) with remaining
    /// capacity or a retry hint attached
    pub fn check(&self, key: &str) -> RateLimitDecision {
        if !self.enabled || self.exempt_keys.contains(key) {
            metrics::RATE_LIMIT_DECISIONS_TOTAL
                .with_label_values(&[self.name, "exempt"])
                .inc();
            return RateLimitDecision::Allowed {
                remaining: self.max_requests,
            };
        }

        let mut bucket = match self.buckets.get_mut(key) {
            Some(bucket) => bucket,
            None => self.buckets.entry(key.to_owned()).or_default(),
        };

        // Read the clock under the bucket lock so slots stay ordered
        let now = self.clock.now();
        bucket.prune(now, self.window);

        let decision = if bucket.len() < self.max_requests {
            bucket.slots.push_back(now);
            RateLimitDecision::Allowed {
                remaining: self.max_requests - bucket.len(),
            }
        } else {
            let oldest = bucket.slots.front().copied().unwrap_or(now);
            RateLimitDecision::Denied {
                // A slot exactly `window` old still counts, so never report zero
                retry_after: self
                    .window
                    .saturating_sub(now.duration_since(oldest))
                    .max(MIN_RETRY_AFTER),
            }
        };
        drop(bucket);

        match decision {
            RateLimitDecision::Allowed { remaining } => {
                trace!(key, remaining, "Rate limit slot consumed");
                metrics::RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[self.name, "allowed"])
                    .inc();
            }
            RateLimitDecision::Denied { retry_after } => {
                debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
                metrics::RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[self.name, "denied"])
                    .inc();
            }
        }

        decision
    }

    /// Free slots for `key` right now, without recording anything
    pub fn remaining(&self, key: &str) -> u32 {
        if !self.enabled || self.exempt_keys.contains(key) {
            return self.max_requests;
        }

        let now = self.clock.now();
        match self.buckets.get(key) {
            Some(bucket) => {
                let live = bucket
                    .slots
                    .iter()
                    .filter(|&&slot| now.duration_since(slot) <= self.window)
                    .count() as u32;
                self.max_requests.saturating_sub(live)
            }
            None => self.max_requests,
        }
    }

    /// Forget everything recorded for `key`
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Remove buckets whose every slot has aged out of the window.
    ///
    /// An empty bucket admits exactly like a missing one, so sweeping never
    /// changes a decision.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.prune(now, self.window);
            !bucket.slots.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of keys currently holding a bucket
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Configured quota per window
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Configured window length
    pub fn window(&self) -> Duration {
        self.window
    }
}
