//! Prometheus metrics for the expiry relay
//!
//! Process-local observability for every pipeline stage:
//! - Expiration listener (notifications, reconnects)
//! - Dedup gate (claims won / lost / failed)
//! - Work publisher (published, failures, latency)
//! - Consumer group (deliveries, acks, redeliveries, exhaustion)
//!
//! These are not the shared "generated / consumed" counters; those live in
//! the store so every process sees the same totals.

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, TextEncoder, opts, register_histogram,
    register_int_counter, register_int_counter_vec,
};

// ============================================================================
// Listener Metrics
// ============================================================================

/// Expiration notifications received from the keyspace feed
pub static EXPIRATIONS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_expirations_received_total",
        "Expiration notifications received from the keyspace feed"
    ))
    .expect("Failed to register EXPIRATIONS_RECEIVED metric")
});

/// Notifications for dedup marker keys that were ignored
pub static MARKER_KEYS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_marker_keys_ignored_total",
        "Expired dedup marker keys filtered before the dedup gate"
    ))
    .expect("Failed to register MARKER_KEYS_IGNORED metric")
});

/// Subscription re-establishments after a broken feed
pub static LISTENER_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_listener_reconnects_total",
        "Times the expiration subscription was re-established"
    ))
    .expect("Failed to register LISTENER_RECONNECTS metric")
});

// ============================================================================
// Dedup Metrics
// ============================================================================

/// Dedup claim results, by outcome (won, lost, error)
pub static DEDUP_CLAIMS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("relay_dedup_claims_total", "Dedup claim attempts by outcome"),
        &["outcome"]
    )
    .expect("Failed to register DEDUP_CLAIMS metric")
});

// ============================================================================
// Publisher Metrics
// ============================================================================

pub static EVENTS_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_events_published_total",
        "Work items appended to the durable queue"
    ))
    .expect("Failed to register EVENTS_PUBLISHED metric")
});

pub static PUBLISH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_publish_failures_total",
        "Work items lost because publishing failed"
    ))
    .expect("Failed to register PUBLISH_FAILURES metric")
});

pub static PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "relay_publish_latency_seconds",
        "Publish round trip latency in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register PUBLISH_LATENCY metric")
});

// ============================================================================
// Consumer Group Metrics
// ============================================================================

/// Delivery attempts handed to a handler (first deliveries and redeliveries)
pub static DELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_deliveries_total",
        "Delivery attempts dispatched to work handlers"
    ))
    .expect("Failed to register DELIVERIES metric")
});

pub static REDELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_redeliveries_total",
        "Delivery attempts after the first one"
    ))
    .expect("Failed to register REDELIVERIES metric")
});

pub static ACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_acks_total",
        "Work items acknowledged by a handler"
    ))
    .expect("Failed to register ACKS metric")
});

/// Items dropped after reaching the redelivery bound
pub static DELIVERIES_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_deliveries_exhausted_total",
        "Work items dropped after the maximum number of delivery attempts"
    ))
    .expect("Failed to register DELIVERIES_EXHAUSTED metric")
});

/// Items dropped by the queue's retention ceiling before anyone acknowledged them
pub static ITEMS_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_queue_items_expired_total",
        "Unacknowledged work items dropped after exceeding the retention age"
    ))
    .expect("Failed to register ITEMS_EXPIRED metric")
});

/// Items discarded because the payload could not be decoded
pub static MALFORMED_DELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_malformed_deliveries_total",
        "Work items discarded because their payload was malformed"
    ))
    .expect("Failed to register MALFORMED_DELIVERIES metric")
});

/// Gather all registered metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_gathered() {
        EXPIRATIONS_RECEIVED.inc();
        DEDUP_CLAIMS.with_label_values(&["won"]).inc();
        PUBLISH_LATENCY.observe(0.01);
        DELIVERIES_EXHAUSTED.inc();

        let body = gather_metrics().unwrap();
        assert!(body.contains("relay_expirations_received_total"));
        assert!(body.contains("relay_dedup_claims_total"));
        assert!(body.contains("relay_deliveries_exhausted_total"));
    }
}
