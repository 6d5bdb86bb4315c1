//! Rate Limit Configuration
//!
//! Quota settings for the sliding-window limiter and the attempt guard.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default rate limits
pub const DEFAULT_MAX_REQUESTS: u32 = 3; // requests per window
pub const DEFAULT_WINDOW_MS: u64 = 1_000; // one second
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5; // attempts per attempt window
pub const DEFAULT_ATTEMPT_WINDOW_SECS: u64 = 3_600; // one hour

/// Sliding-window limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Accepted requests allowed per key within one window
    pub max_requests: u32,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// How often idle buckets are swept, in seconds (0 disables the sweeper)
    pub sweep_interval_secs: u64,

    /// Keys that are never throttled
    pub exempt_keys: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_MAX_REQUESTS,
            window_ms: DEFAULT_WINDOW_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            exempt_keys: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with an explicit quota
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Sweep interval, `None` when sweeping is turned off
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Apply `THROTTLE_RELAY_*` environment overrides
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("THROTTLE_RELAY_RATE_LIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Ok(val) = std::env::var("THROTTLE_RELAY_MAX_REQUESTS") {
            if let Ok(limit) = val.parse::<u32>() {
                if limit > 0 {
                    self.max_requests = limit;
                }
            }
        }

        if let Ok(val) = std::env::var("THROTTLE_RELAY_WINDOW_MS") {
            if let Ok(window) = val.parse::<u64>() {
                if window > 0 {
                    self.window_ms = window;
                }
            }
        }

        if let Ok(val) = std::env::var("THROTTLE_RELAY_SWEEP_INTERVAL_SECS") {
            if let Ok(interval) = val.parse() {
                self.sweep_interval_secs = interval;
            }
        }

        self
    }
}

/// Attempt guard configuration (password-reset style lockout)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttemptConfig {
    /// Attempts allowed per key within one window
    pub max_attempts: u32,

    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window_secs: DEFAULT_ATTEMPT_WINDOW_SECS,
        }
    }
}

impl AttemptConfig {
    /// Window length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
