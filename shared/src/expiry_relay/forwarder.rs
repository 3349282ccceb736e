// ============================================================================
// Expiration Forwarder
// ============================================================================
//
// Listener-side handler: turns one expiration notification into at most one
// work item per dedup window across every listening process.
//
//   expired key ─┬─ marker key?      -> ignored
//                ├─ claim error?     -> dropped (logged, not retried)
//                ├─ claim lost?      -> dropped (another process forwards)
//                └─ claim won        -> publish -> forwarded | publish failed
//
// A publish failure after a won claim loses the event for the rest of the
// window: the marker keeps every other process from forwarding it.
//
// ============================================================================

use crate::dedup::DedupGate;
use crate::events::{ExpirationEvent, ForwardOutcome};
use crate::handler::EventHandler;
use crate::queue::WorkPublisher;
use async_trait::async_trait;
use relay_metrics::MARKER_KEYS_IGNORED;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ExpirationForwarder {
    gate: DedupGate,
    publisher: Arc<dyn WorkPublisher>,
}

impl ExpirationForwarder {
    pub fn new(gate: DedupGate, publisher: Arc<dyn WorkPublisher>) -> Self {
        Self { gate, publisher }
    }

    pub async fn forward(&self, key: &str) -> ForwardOutcome {
        if self.gate.is_marker(key) {
            MARKER_KEYS_IGNORED.inc();
            debug!(key = %key, "Ignoring expiration of a dedup marker");
            return ForwardOutcome::IgnoredMarker;
        }

        match self.gate.try_claim(key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Expiration already claimed by another listener");
                return ForwardOutcome::Duplicate;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    error_code = e.error_code(),
                    transient = e.is_transient(),
                    key = %key,
                    "Dedup claim failed, dropping expiration"
                );
                return ForwardOutcome::ClaimFailed;
            }
        }

        match self.publisher.publish(key).await {
            Ok(message_id) => {
                info!(key = %key, message_id = %message_id, "Forwarded expired key to work queue");
                ForwardOutcome::Forwarded
            }
            Err(e) => {
                error!(
                    error = %e,
                    error_code = e.error_code(),
                    transient = e.is_transient(),
                    key = %key,
                    "Failed to publish expired key, event lost for this dedup window"
                );
                ForwardOutcome::PublishFailed
            }
        }
    }
}

#[async_trait]
impl EventHandler<ExpirationEvent> for ExpirationForwarder {
    type Outcome = ForwardOutcome;

    async fn handle(&self, event: ExpirationEvent) -> ForwardOutcome {
        self.forward(&event.key).await
    }
}
