// Configuration File Support
//
// Configuration for the throttle relay, read from TOML with environment
// variable overrides. The default location is the platform config directory,
// e.g. ~/.config/throttle-relay/config.toml on Linux.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{DeliveryConfig, DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};
use crate::rate_limit::{AttemptConfig, RateLimitConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Sliding-window limiter
    pub rate_limit: RateLimitConfig,

    /// Attempt guard
    pub attempts: AttemptConfig,

    /// Dispatch queue and worker
    pub dispatch: DispatchConfig,

    /// Delivery target
    pub delivery: DeliveryConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Dispatch queue and worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of buffered items
    pub queue_capacity: usize,

    /// How long a producer may wait for capacity; waits indefinitely when unset
    pub enqueue_timeout_ms: Option<u64>,

    /// Per-item delivery budget in seconds (0 disables the limit)
    pub delivery_timeout_secs: u64,

    /// How long shutdown waits for the queue to drain before cancelling
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: None,
            delivery_timeout_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl DispatchConfig {
    /// Producer wait limit
    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_ms.map(Duration::from_millis)
    }

    /// Per-item delivery limit
    pub fn delivery_timeout(&self) -> Option<Duration> {
        (self.delivery_timeout_secs > 0).then(|| Duration::from_secs(self.delivery_timeout_secs))
    }

    /// Drain deadline on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve metrics over HTTP
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// Missing files yield the defaults. Environment overrides are applied
    /// and the result is validated either way.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "throttle-relay") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if platform dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("throttle-relay")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - THROTTLE_RELAY_LOG_LEVEL, THROTTLE_RELAY_LOG_FORMAT
    /// - THROTTLE_RELAY_RATE_LIMIT_ENABLED, THROTTLE_RELAY_MAX_REQUESTS,
    ///   THROTTLE_RELAY_WINDOW_MS, THROTTLE_RELAY_SWEEP_INTERVAL_SECS
    /// - THROTTLE_RELAY_QUEUE_CAPACITY
    /// - THROTTLE_RELAY_WEBHOOK_URL, THROTTLE_RELAY_WEBHOOK_TOKEN
    /// - THROTTLE_RELAY_METRICS_ENABLED, THROTTLE_RELAY_METRICS_PORT
    pub fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("THROTTLE_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("THROTTLE_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        self.rate_limit = self.rate_limit.apply_env_overrides();

        // Dispatch overrides
        if let Ok(capacity) = std::env::var("THROTTLE_RELAY_QUEUE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                if capacity > 0 {
                    self.dispatch.queue_capacity = capacity;
                }
            }
        }

        // Delivery overrides
        if let Ok(url) = std::env::var("THROTTLE_RELAY_WEBHOOK_URL") {
            self.delivery.webhook_url = Some(url);
        }
        if let Ok(token) = std::env::var("THROTTLE_RELAY_WEBHOOK_TOKEN") {
            self.delivery.auth_token = Some(token);
        }

        // Metrics overrides
        if let Ok(enabled) = std::env::var("THROTTLE_RELAY_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("THROTTLE_RELAY_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate quotas
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be > 0");
        }
        if self.rate_limit.window_ms == 0 {
            anyhow::bail!("rate_limit.window_ms must be > 0");
        }
        if self.attempts.max_attempts == 0 {
            anyhow::bail!("attempts.max_attempts must be > 0");
        }
        if self.attempts.window_secs == 0 {
            anyhow::bail!("attempts.window_secs must be > 0");
        }

        // Validate dispatch configuration
        if self.dispatch.queue_capacity == 0 {
            anyhow::bail!("dispatch.queue_capacity must be > 0");
        }
        if self.dispatch.queue_capacity > MAX_QUEUE_CAPACITY {
            anyhow::bail!(
                "dispatch.queue_capacity must be <= {}, got {}",
                MAX_QUEUE_CAPACITY,
                self.dispatch.queue_capacity
            );
        }
        if self.dispatch.enqueue_timeout_ms == Some(0) {
            anyhow::bail!("dispatch.enqueue_timeout_ms must be > 0 when set");
        }

        // Validate delivery configuration
        if let Some(url) = &self.delivery.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("delivery.webhook_url must be an http(s) URL, got {}", url);
            }
        }
        if self.delivery.request_timeout_secs == 0 {
            anyhow::bail!("delivery.request_timeout_secs must be > 0");
        }

        // Validate metrics configuration
        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
