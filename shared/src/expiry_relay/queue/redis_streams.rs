// ============================================================================
// Redis Streams Work Queue
// ============================================================================
//
// Stream layout:
//   XADD <stream> MINID ~ <now - max_age> * subject <subject> payload <json>
//
// Consumer group semantics on top of XREADGROUP / XPENDING / XCLAIM:
//
// 1. Fresh entries: XREADGROUP ... > (blocking, on a dedicated connection).
//    The entry enters the group's pending list owned by this member.
// 2. Ack: XACK + XDEL - the entry leaves the pending list and the stream.
// 3. Ack deadline: every `claim_interval` each member scans XPENDING. Entries
//    idle for at least `ack_wait` are taken over with XCLAIM (which bumps the
//    delivery count) and dispatched again. XCLAIM re-checks idleness on the
//    server, so two members never both win the same entry.
// 4. Bound: a pending entry already delivered `max_deliver` times is retired
//    (XACK + XDEL) instead of being claimed, and reported as exhausted.
//
// If the group disappears (stream key deleted, Redis restarted without
// persistence) reads fail with NOGROUP; the member recreates the group and
// carries on.
//
// Handler tasks outlive the read loop; an ack arriving after the deadline
// still removes the entry, even if another member already holds a redelivery.
//
// ============================================================================

use super::{CircuitBreaker, CircuitBreakerConfig, ConsumerGroup, WorkHandler, WorkPublisher};
use crate::events::{ConsumerId, Delivery, HandleOutcome, WorkItem};
use async_trait::async_trait;
use chrono::Utc;
use relay_config::{DeliverPolicy, QueueConfig};
use relay_error::{RelayError, RelayResult};
use relay_metrics::{
    ACKS, DELIVERIES, DELIVERIES_EXHAUSTED, EVENTS_PUBLISHED, MALFORMED_DELIVERIES,
    PUBLISH_FAILURES, PUBLISH_LATENCY, REDELIVERIES,
};
use relay_redis::{RedisClient, StreamEntry, StreamReadOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending entries inspected per reclaim tick
const PENDING_SCAN_LIMIT: usize = 100;
/// Pause after a failed read before trying again
const READ_ERROR_PAUSE: Duration = Duration::from_secs(1);

const FIELD_SUBJECT: &str = "subject";
const FIELD_PAYLOAD: &str = "payload";

pub struct RedisStreamQueue {
    redis: RedisClient,
    config: QueueConfig,
    consumer: ConsumerId,
    ensured: OnceCell<()>,
    breaker: CircuitBreaker,
}

impl RedisStreamQueue {
    pub fn new(redis: RedisClient, config: QueueConfig, consumer: ConsumerId) -> Self {
        Self {
            redis,
            config,
            consumer,
            ensured: OnceCell::new(),
            breaker: CircuitBreaker::new("redis-streams", CircuitBreakerConfig::default()),
        }
    }

    fn start_id(&self) -> &'static str {
        match self.config.deliver_policy {
            DeliverPolicy::All => "0",
            DeliverPolicy::New => "$",
        }
    }

    async fn create_group(&self) -> RelayResult<()> {
        let mut redis = self.redis.clone();
        let created = redis
            .xgroup_create_if_missing(&self.config.stream, &self.config.group, self.start_id())
            .await?;
        if created {
            info!(
                stream = %self.config.stream,
                group = %self.config.group,
                start = self.start_id(),
                "Created work queue stream and consumer group"
            );
        } else {
            debug!(
                stream = %self.config.stream,
                group = %self.config.group,
                "Work queue consumer group already exists"
            );
        }
        Ok(())
    }

    /// Recreate the group after a NOGROUP error; `false` for any other error
    async fn recover_missing_group(&self, error: &RelayError) -> bool {
        let RelayError::Redis(e) = error else {
            return false;
        };
        if e.code() != Some("NOGROUP") {
            return false;
        }

        warn!(
            stream = %self.config.stream,
            group = %self.config.group,
            "Consumer group is gone, recreating it"
        );
        match self.create_group().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to recreate consumer group");
                false
            }
        }
    }

    /// Read fresh entries (blocking up to `read_block`) and dispatch them
    async fn read_new(&self, reader: &mut RedisClient, handler: &Arc<WorkHandler>) -> RelayResult<usize> {
        let options = StreamReadOptions {
            block: Some(self.config.read_block.as_millis() as u64),
            count: Some(self.config.read_batch),
        };
        let entries = reader
            .xreadgroup_new(
                &self.config.stream,
                &self.config.group,
                self.consumer.as_str(),
                options,
            )
            .await?;

        let count = entries.len();
        for entry in entries {
            self.dispatch(handler, entry, 1).await;
        }
        Ok(count)
    }

    /// Retire exhausted entries and take over the ones past their ack deadline
    async fn reclaim_expired(&self, handler: &Arc<WorkHandler>) -> RelayResult<()> {
        let mut redis = self.redis.clone();
        let pending = redis
            .xpending_entries(&self.config.stream, &self.config.group, PENDING_SCAN_LIMIT)
            .await?;

        let mut exhausted = Vec::new();
        let mut expired = HashMap::new();
        for entry in pending {
            if entry.idle < self.config.ack_wait {
                continue;
            }
            if entry.times_delivered >= u64::from(self.config.max_deliver) {
                exhausted.push(entry);
            } else {
                expired.insert(entry.id.clone(), entry.times_delivered);
            }
        }

        if !exhausted.is_empty() {
            let ids: Vec<&str> = exhausted.iter().map(|e| e.id.as_str()).collect();
            redis
                .xack_and_delete(&self.config.stream, &self.config.group, &ids)
                .await?;
            for entry in &exhausted {
                DELIVERIES_EXHAUSTED.inc();
                warn!(
                    message_id = %entry.id,
                    last_consumer = %entry.consumer,
                    deliveries = entry.times_delivered,
                    max_deliver = self.config.max_deliver,
                    "Work item exhausted its deliveries, dropping"
                );
            }
        }

        if expired.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = expired.keys().map(String::as_str).collect();
        let claimed = redis
            .xclaim_idle(
                &self.config.stream,
                &self.config.group,
                self.consumer.as_str(),
                self.config.ack_wait,
                &ids,
            )
            .await?;

        for entry in claimed {
            let previous = expired.get(&entry.id).copied().unwrap_or(1);
            let attempt = u32::try_from(previous + 1).unwrap_or(u32::MAX);
            self.dispatch(handler, entry, attempt).await;
        }
        Ok(())
    }

    /// Hand one entry to the handler on its own task
    async fn dispatch(&self, handler: &Arc<WorkHandler>, entry: StreamEntry, attempt: u32) {
        let item = match entry
            .fields
            .get(FIELD_PAYLOAD)
            .map(|payload| WorkItem::from_payload(payload.as_bytes()))
        {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                self.retire_malformed(&entry.id, &e.to_string()).await;
                return;
            }
            None => {
                self.retire_malformed(&entry.id, "missing payload field").await;
                return;
            }
        };

        DELIVERIES.inc();
        if attempt > 1 {
            REDELIVERIES.inc();
        }

        let delivery = Delivery {
            item,
            attempt,
            message_id: entry.id,
        };
        debug!(
            key = %delivery.item.key,
            message_id = %delivery.message_id,
            attempt = attempt,
            "Dispatching work item"
        );

        let handler = Arc::clone(handler);
        let mut redis = self.redis.clone();
        let stream = self.config.stream.clone();
        let group = self.config.group.clone();
        let ack_wait = self.config.ack_wait;

        tokio::spawn(async move {
            let started = Instant::now();
            let message_id = delivery.message_id.clone();
            let key = delivery.item.key.clone();

            match handler.handle(delivery).await {
                HandleOutcome::Ack => {
                    if started.elapsed() > ack_wait {
                        warn!(
                            key = %key,
                            message_id = %message_id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Acknowledging after the ack deadline, item may have been redelivered"
                        );
                    }
                    match redis.xack_and_delete(&stream, &group, &[message_id.as_str()]).await {
                        Ok(_) => {
                            ACKS.inc();
                            debug!(key = %key, message_id = %message_id, "Work item acknowledged");
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                message_id = %message_id,
                                "Failed to acknowledge work item, it will be redelivered"
                            );
                        }
                    }
                }
                HandleOutcome::Retry => {
                    debug!(
                        key = %key,
                        message_id = %message_id,
                        "Handler asked for redelivery, leaving item pending"
                    );
                }
            }
        });
    }

    async fn retire_malformed(&self, message_id: &str, reason: &str) {
        MALFORMED_DELIVERIES.inc();
        warn!(
            message_id = %message_id,
            reason = %reason,
            "Discarding malformed work queue entry"
        );
        let mut redis = self.redis.clone();
        if let Err(e) = redis
            .xack_and_delete(&self.config.stream, &self.config.group, &[message_id])
            .await
        {
            warn!(error = %e, message_id = %message_id, "Failed to discard malformed entry");
        }
    }
}

#[async_trait]
impl WorkPublisher for RedisStreamQueue {
    async fn ensure_stream(&self) -> RelayResult<()> {
        self.ensured
            .get_or_try_init(|| self.create_group())
            .await?;
        Ok(())
    }

    async fn publish(&self, key: &str) -> RelayResult<String> {
        self.ensure_stream().await?;

        let payload = WorkItem::new(key).to_payload()?;
        let fields = [
            (FIELD_SUBJECT, self.config.subject.as_str()),
            (FIELD_PAYLOAD, payload.as_str()),
        ];
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        let timer = PUBLISH_LATENCY.start_timer();
        let result = self
            .breaker
            .call(async {
                let mut redis = self.redis.clone();
                redis
                    .xadd_with_max_age(&self.config.stream, &fields, self.config.max_age, now_ms)
                    .await
                    .map_err(RelayError::from)
            })
            .await;
        timer.observe_duration();

        match &result {
            Ok(id) => {
                EVENTS_PUBLISHED.inc();
                debug!(key = %key, message_id = %id, stream = %self.config.stream, "Work item published");
            }
            Err(_) => PUBLISH_FAILURES.inc(),
        }
        result
    }
}

#[async_trait]
impl ConsumerGroup for RedisStreamQueue {
    async fn run(&self, handler: Arc<WorkHandler>, cancel: CancellationToken) -> RelayResult<()> {
        self.ensure_stream().await?;
        let mut reader = self.redis.dedicated().await?;

        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.consumer,
            "Joined work queue consumer group"
        );

        let mut last_reclaim: Option<Instant> = None;

        while !cancel.is_cancelled() {
            let reclaim_due = last_reclaim
                .map(|at| at.elapsed() >= self.config.claim_interval)
                .unwrap_or(true);
            if reclaim_due {
                if let Err(e) = self.reclaim_expired(&handler).await {
                    if !self.recover_missing_group(&e).await {
                        warn!(error = %e, "Failed to reclaim expired deliveries");
                    }
                }
                last_reclaim = Some(Instant::now());
            }

            // Cancelling mid-read may leave entries assigned to this member;
            // they expire and are reclaimed by the rest of the group.
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.read_new(&mut reader, &handler) => read,
            };

            if let Err(e) = read {
                if self.recover_missing_group(&e).await {
                    continue;
                }
                error!(error = %e, "Failed to read from work queue");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_PAUSE) => {}
                }
            }
        }

        info!(consumer = %self.consumer, "Left work queue consumer group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use serial_test::serial;
    use std::sync::Mutex;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7

    struct Collect {
        outcome: HandleOutcome,
        seen: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl EventHandler<Delivery> for Collect {
        type Outcome = HandleOutcome;

        async fn handle(&self, delivery: Delivery) -> HandleOutcome {
            self.seen.lock().unwrap().push(delivery);
            self.outcome
        }
    }

    async fn queue(stream: &str, consumer: &str) -> RedisStreamQueue {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let mut redis = RedisClient::connect(&url).await.unwrap();
        redis.del(stream).await.unwrap();

        let config = QueueConfig {
            stream: stream.to_string(),
            ack_wait: Duration::from_millis(300),
            read_block: Duration::from_millis(100),
            claim_interval: Duration::from_millis(100),
            ..QueueConfig::default()
        };
        RedisStreamQueue::new(redis, config, ConsumerId::new(consumer))
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_publish_then_ack_empties_stream() {
        let queue = Arc::new(queue("relay_test:stream:ack", "worker-a").await);
        let handler = Arc::new(Collect {
            outcome: HandleOutcome::Ack,
            seen: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        queue.publish("gen-key:1").await.unwrap();

        let member = queue.clone();
        let dyn_handler: Arc<WorkHandler> = handler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { member.run(dyn_handler, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].item.key, "gen-key:1");
        assert_eq!(seen[0].attempt, 1);

        let mut redis = queue.redis.clone();
        assert_eq!(redis.xlen("relay_test:stream:ack").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_unacked_item_is_delivered_at_most_max_deliver_times() {
        let queue = Arc::new(queue("relay_test:stream:retry", "worker-a").await);
        let handler = Arc::new(Collect {
            outcome: HandleOutcome::Retry,
            seen: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        queue.publish("gen-key:stuck").await.unwrap();

        let member = queue.clone();
        let dyn_handler: Arc<WorkHandler> = handler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { member.run(dyn_handler, cancel).await }
        });

        // 3 deliveries, 300ms apart, then retirement
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let attempts: Vec<u32> = handler.seen.lock().unwrap().iter().map(|d| d.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        let mut redis = queue.redis.clone();
        assert_eq!(redis.xlen("relay_test:stream:retry").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_member_recreates_group_after_stream_is_deleted() {
        let queue = Arc::new(queue("relay_test:stream:regroup", "worker-a").await);
        let handler = Arc::new(Collect {
            outcome: HandleOutcome::Ack,
            seen: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let member = queue.clone();
        let dyn_handler: Arc<WorkHandler> = handler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { member.run(dyn_handler, cancel).await }
        });

        queue.publish("gen-key:before").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Drops the group with the stream; the next XADD recreates the
        // stream without it
        let mut redis = queue.redis.clone();
        redis.del("relay_test:stream:regroup").await.unwrap();
        queue.publish("gen-key:after").await.unwrap();

        tokio::time::sleep(Duration::from_millis(3000)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let keys: Vec<String> = handler
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.item.key.clone())
            .collect();
        assert_eq!(keys, vec!["gen-key:before", "gen-key:after"]);
        assert_eq!(redis.xlen("relay_test:stream:regroup").await.unwrap(), 0);
    }
}
