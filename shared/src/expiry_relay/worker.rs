//! Consumer-side handler: counts each handled work item and acknowledges it

use crate::counters::PipelineCounters;
use crate::events::{ConsumerId, Delivery, HandleOutcome};
use crate::handler::EventHandler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Records "this worker handled one item" in the shared counters
///
/// Counter writes are best-effort: a failure is logged and the item is still
/// acknowledged, so a counter outage never turns into redelivery churn.
pub struct CountingHandler {
    counters: Arc<dyn PipelineCounters>,
    consumer_id: ConsumerId,
}

impl CountingHandler {
    pub fn new(counters: Arc<dyn PipelineCounters>, consumer_id: ConsumerId) -> Self {
        Self {
            counters,
            consumer_id,
        }
    }
}

#[async_trait]
impl EventHandler<Delivery> for CountingHandler {
    type Outcome = HandleOutcome;

    async fn handle(&self, delivery: Delivery) -> HandleOutcome {
        let worker = self.consumer_id.as_str();

        if let Err(e) = self.counters.incr_consumed_by(worker).await {
            warn!(error = %e, worker = %worker, "Failed to increment per-worker counter");
        }
        if let Err(e) = self.counters.incr_consumed().await {
            warn!(error = %e, "Failed to increment consumed counter");
        }

        debug!(
            key = %delivery.item.key,
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            worker = %worker,
            "Processed expired key"
        );
        HandleOutcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{CounterSnapshot, MemoryCounters};
    use crate::events::WorkItem;
    use relay_error::{RelayError, RelayResult};

    fn delivery(key: &str) -> Delivery {
        Delivery {
            item: WorkItem::new(key),
            attempt: 1,
            message_id: "1-0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_counts_per_worker_and_total() {
        let counters = Arc::new(MemoryCounters::new());
        let handler = CountingHandler::new(counters.clone(), ConsumerId::new("worker-a"));

        assert_eq!(handler.handle(delivery("gen-key:1")).await, HandleOutcome::Ack);
        assert_eq!(handler.handle(delivery("gen-key:2")).await, HandleOutcome::Ack);

        let snapshot = counters.snapshot().await.unwrap();
        assert_eq!(snapshot.consumed, 2);
        assert_eq!(snapshot.per_worker.get("worker-a"), Some(&2));
    }

    struct Unreachable;

    #[async_trait]
    impl PipelineCounters for Unreachable {
        async fn incr_generated(&self) -> RelayResult<i64> {
            Err(RelayError::Io(std::io::Error::other("counters unreachable")))
        }
        async fn incr_consumed(&self) -> RelayResult<i64> {
            Err(RelayError::Io(std::io::Error::other("counters unreachable")))
        }
        async fn incr_consumed_by(&self, _worker: &str) -> RelayResult<i64> {
            Err(RelayError::Io(std::io::Error::other("counters unreachable")))
        }
        async fn snapshot(&self) -> RelayResult<CounterSnapshot> {
            Err(RelayError::Io(std::io::Error::other("counters unreachable")))
        }
        async fn reset(&self) -> RelayResult<()> {
            Err(RelayError::Io(std::io::Error::other("counters unreachable")))
        }
    }

    #[tokio::test]
    async fn test_counter_outage_still_acks() {
        let handler = CountingHandler::new(Arc::new(Unreachable), ConsumerId::new("worker-a"));
        assert_eq!(handler.handle(delivery("gen-key:1")).await, HandleOutcome::Ack);
    }
}
