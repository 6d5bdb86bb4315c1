// Delivery capabilities
//
// The worker hands every dequeued item to a `Delivery`. The crate ships an
// HTTP webhook delivery and a log-only delivery for dry runs; the
// surrounding system may plug in anything else (e.g. an email sender).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::DeliveryError;

/// Performs the side effect for one item
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Deliver `payload` to `recipient`
    async fn deliver(&self, recipient: &str, payload: &str) -> Result<(), DeliveryError>;
}

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// URL to POST items to; items are only logged when unset
    pub webhook_url: Option<String>,

    /// Bearer token for authentication
    pub auth_token: Option<String>,

    /// Custom HTTP headers to include
    pub headers: HashMap<String, String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            auth_token: None,
            headers: HashMap::new(),
            request_timeout_secs: 10,
        }
    }
}

/// JSON body posted by [`WebhookDelivery`]
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookBody {
    pub id: Uuid,
    pub recipient: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivers items by POSTing them to a webhook endpoint
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    headers: HashMap<String, String>,
    timeout: Duration,
}

impl WebhookDelivery {
    /// Create a webhook delivery targeting `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Build from configuration; `None` when no URL is configured
    pub fn from_config(config: &DeliveryConfig) -> Option<Self> {
        let url = config.webhook_url.as_ref()?;
        let mut delivery = Self::new(url.clone())
            .with_timeout(Duration::from_secs(config.request_timeout_secs))
            .with_headers(config.headers.clone());
        if let Some(token) = &config.auth_token {
            delivery = delivery.with_auth_token(token.clone());
        }
        Some(delivery)
    }

    /// Send `Authorization: Bearer <token>`
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Extra headers sent with every request
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, recipient: &str, payload: &str) -> Result<(), DeliveryError> {
        let body = WebhookBody {
            id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        };
        let start = Instant::now();

        let mut request = self.client.post(&self.url).timeout(self.timeout).json(&body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(
            id = %body.id,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Webhook responded"
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Delivery that only writes a log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, recipient: &str, payload: &str) -> Result<(), DeliveryError> {
        info!(recipient, payload, "Delivered (dry run)");
        Ok(())
    }
}
