// ============================================================================
// Pipeline Event Types
// ============================================================================
//
// ExpirationEvent  - "key X expired", straight from the keyspace feed
// WorkItem         - an admitted expiration, as stored in the work queue
// Delivery         - one delivery attempt of a WorkItem to a group member
//
// ============================================================================

use chrono::{DateTime, Utc};
use relay_error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Notification that a TTL-bearing record reached its expiration time
///
/// Ephemeral: exists only while in flight, never persisted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationEvent {
    pub key: String,
}

impl ExpirationEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// An expiration that passed the dedup gate and was appended to the queue
///
/// Owned by the broker once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub key: String,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> RelayResult<Self> {
        let item: WorkItem = serde_json::from_slice(payload)
            .map_err(|e| RelayError::Malformed(format!("undecodable work item: {}", e)))?;
        if item.key.is_empty() {
            return Err(RelayError::Malformed("work item has an empty key".to_string()));
        }
        Ok(item)
    }
}

/// One delivery attempt of a work item to a consumer-group member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub item: WorkItem,
    /// 1 for the first delivery, incremented on every redelivery
    pub attempt: u32,
    /// Broker-assigned identifier (stream entry ID, topic/partition/offset, ...)
    pub message_id: String,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Stable identity of one worker process within the consumer group
///
/// Used for per-worker counters and logs only; the broker owns routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Side effects completed - acknowledge the item
    Ack,
    /// Leave unacknowledged; the broker redelivers after the ack deadline
    Retry,
}

/// Result of handling one expiration notification on the listener side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// This process won the claim and the item is in the queue
    Forwarded,
    /// Another process already claimed the key in the current window
    Duplicate,
    /// The expired key was one of our own dedup markers
    IgnoredMarker,
    /// The claim could not be attempted (store unavailable) - event dropped
    ClaimFailed,
    /// The claim was won but publishing failed - event lost for this window
    PublishFailed,
}

impl fmt::Display for ForwardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ForwardOutcome::Forwarded => "forwarded",
            ForwardOutcome::Duplicate => "duplicate",
            ForwardOutcome::IgnoredMarker => "ignored_marker",
            ForwardOutcome::ClaimFailed => "claim_failed",
            ForwardOutcome::PublishFailed => "publish_failed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_wire_format() {
        let item = WorkItem::new("gen-key:42");
        let payload = item.to_payload().unwrap();
        assert!(payload.contains("\"key\":\"gen-key:42\""));
        assert!(payload.contains("\"enqueuedAt\""));

        let decoded = WorkItem::from_payload(payload.as_bytes()).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let err = WorkItem::from_payload(b"gen-key:42").unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_PAYLOAD");

        let err = WorkItem::from_payload(br#"{"key":"","enqueuedAt":"2024-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_PAYLOAD");
    }

    #[test]
    fn test_redelivery_flag() {
        let delivery = Delivery {
            item: WorkItem::new("k"),
            attempt: 2,
            message_id: "1-0".to_string(),
        };
        assert!(delivery.is_redelivery());
    }

    #[test]
    fn test_forward_outcome_display() {
        assert_eq!(ForwardOutcome::IgnoredMarker.to_string(), "ignored_marker");
        assert_eq!(ForwardOutcome::PublishFailed.to_string(), "publish_failed");
    }
}
