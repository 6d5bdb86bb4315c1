// Dispatch items
//
// An item is an opaque (recipient, payload) pair, e.g. an email address and
// a callback URL. The queue wraps accepted items with their acceptance
// sequence number and time.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Immutable unit of work handed to a delivery capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchItem {
    recipient: String,
    payload: String,
}

impl DispatchItem {
    /// Create a new item
    pub fn new(recipient: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            payload: payload.into(),
        }
    }

    /// Who the item is addressed to
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// What gets delivered
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Split into `(recipient, payload)`
    pub fn into_parts(self) -> (String, String) {
        (self.recipient, self.payload)
    }
}

/// An item accepted into the queue
#[derive(Debug, Clone)]
pub struct QueuedItem {
    /// Acceptance order, starting at 0
    pub seq: u64,
    /// When the item entered the buffer
    pub accepted_at: Instant,
    /// The item itself
    pub item: DispatchItem,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_accessors() {
        let item = DispatchItem::new("user@example.com", "https://example.com/reset?token=abc");
        assert_eq!(item.recipient(), "user@example.com");
        assert_eq!(item.payload(), "https://example.com/reset?token=abc");

        let (recipient, payload) = item.into_parts();
        assert_eq!(recipient, "user@example.com");
        assert_eq!(payload, "https://example.com/reset?token=abc");
    }

    #[test]
    fn test_item_serializes_as_pair() {
        let item = DispatchItem::new("a", "b");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json, serde_json::json!({"recipient": "a", "payload": "b"}));
    }
}
