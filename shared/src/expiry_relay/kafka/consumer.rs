use super::config::create_client_config;
use super::producer::kafka_error;
use crate::events::{ConsumerId, Delivery, HandleOutcome, WorkItem};
use crate::queue::{ConsumerGroup, WorkHandler};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use relay_config::{DeliverPolicy, KafkaConfig, QueueConfig};
use relay_error::RelayResult;
use relay_metrics::{ACKS, DELIVERIES, DELIVERIES_EXHAUSTED, MALFORMED_DELIVERIES, REDELIVERIES};
use relay_redis::RedisClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed receive before trying again
const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// How one message left the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Exhausted,
    Discarded,
    /// Shutdown interrupted processing; the offset stays uncommitted
    Abandoned,
}

/// Delivery attempts per message, kept in Redis so the bound survives
/// restarts and partition rebalances
///
/// Key: `retry_count:{topic}:{partition}:{offset}`, expiring with the topic's
/// retention.
#[derive(Clone)]
struct AttemptLedger {
    redis: RedisClient,
    prefix: String,
    ttl: Duration,
}

impl AttemptLedger {
    fn key(&self, message_id: &str) -> String {
        format!("{}{}", self.prefix, message_id)
    }

    /// Record one more attempt; falls back to the local count if Redis is down
    async fn next_attempt(&self, message_id: &str, local_attempt: u32) -> u32 {
        let mut redis = self.redis.clone();
        match redis.incr_with_ttl(&self.key(message_id), self.ttl).await {
            Ok(count) => u32::try_from(count.max(1)).unwrap_or(u32::MAX),
            Err(e) => {
                warn!(
                    error = %e,
                    message_id = %message_id,
                    "Failed to record delivery attempt, using local count"
                );
                local_attempt
            }
        }
    }

    async fn clear(&self, message_id: &str) {
        let mut redis = self.redis.clone();
        if let Err(e) = redis.del(self.key(message_id)).await {
            debug!(error = %e, message_id = %message_id, "Failed to clear delivery attempts");
        }
    }
}

/// Consumer-group member on the work queue topic
///
/// Messages of one partition are handled in order: each is run to an ack,
/// exhaustion or shutdown before the next is read, and its offset is committed
/// afterwards. Parallelism comes from partitions spread across members.
pub struct KafkaConsumerGroup {
    kafka: KafkaConfig,
    queue: QueueConfig,
    consumer_id: ConsumerId,
    ledger: AttemptLedger,
}

impl KafkaConsumerGroup {
    pub fn new(
        kafka: KafkaConfig,
        queue: QueueConfig,
        consumer_id: ConsumerId,
        redis: RedisClient,
        retry_count_prefix: String,
    ) -> Self {
        let ledger = AttemptLedger {
            redis,
            prefix: retry_count_prefix,
            ttl: queue.max_age,
        };
        Self {
            kafka,
            queue,
            consumer_id,
            ledger,
        }
    }

    fn create_consumer(&self) -> RelayResult<StreamConsumer> {
        let offset_reset = match self.queue.deliver_policy {
            DeliverPolicy::All => "earliest",
            DeliverPolicy::New => "latest",
        };

        let consumer: StreamConsumer = create_client_config(&self.kafka)
            .set("group.id", &self.queue.group)
            .set("client.id", self.consumer_id.as_str())
            // Offsets are committed by hand after ack or exhaustion
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(kafka_error)?;

        consumer
            .subscribe(&[self.queue.stream.as_str()])
            .map_err(kafka_error)?;
        Ok(consumer)
    }

    /// Deliver one message until it is acknowledged, exhausted or abandoned
    async fn settle(
        &self,
        handler: &Arc<WorkHandler>,
        item: WorkItem,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Settlement {
        let max_deliver = self.queue.max_deliver;
        let mut local_attempt = 0;

        loop {
            local_attempt += 1;
            let attempt = self.ledger.next_attempt(message_id, local_attempt).await;
            if attempt > max_deliver {
                return self.exhausted(&item, message_id, attempt - 1);
            }

            DELIVERIES.inc();
            if attempt > 1 {
                REDELIVERIES.inc();
            }

            let delivery = Delivery {
                item: item.clone(),
                attempt,
                message_id: message_id.to_string(),
            };
            let deadline = Instant::now() + self.queue.ack_wait;
            let task = tokio::spawn({
                let handler = Arc::clone(handler);
                async move { handler.handle(delivery).await }
            });

            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(HandleOutcome::Ack)) => {
                    ACKS.inc();
                    self.ledger.clear(message_id).await;
                    return Settlement::Acked;
                }
                Ok(Ok(HandleOutcome::Retry)) => {
                    debug!(message_id = %message_id, attempt = attempt, "Handler asked for redelivery");
                }
                Ok(Err(e)) => {
                    error!(error = %e, message_id = %message_id, attempt = attempt, "Work handler panicked");
                }
                Err(_) => {
                    // The handler keeps running; its outcome is no longer awaited
                    warn!(
                        message_id = %message_id,
                        attempt = attempt,
                        ack_wait_ms = self.queue.ack_wait.as_millis() as u64,
                        "Ack deadline exceeded, redelivering"
                    );
                }
            }

            if attempt >= max_deliver {
                return self.exhausted(&item, message_id, attempt);
            }

            // Redelivery waits out the rest of the ack deadline
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Settlement::Abandoned,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn exhausted(&self, item: &WorkItem, message_id: &str, deliveries: u32) -> Settlement {
        DELIVERIES_EXHAUSTED.inc();
        warn!(
            key = %item.key,
            message_id = %message_id,
            deliveries = deliveries,
            max_deliver = self.queue.max_deliver,
            "Work item exhausted its deliveries, dropping"
        );
        Settlement::Exhausted
    }

    fn commit(&self, consumer: &StreamConsumer, message: &OwnedMessage) {
        let mut offsets = TopicPartitionList::new();
        let added = offsets.add_partition_offset(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset() + 1),
        );
        let committed = added.and_then(|_| consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = committed {
            warn!(
                error = %e,
                partition = message.partition(),
                offset = message.offset(),
                "Failed to commit offset, message may be redelivered"
            );
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn run(&self, handler: Arc<WorkHandler>, cancel: CancellationToken) -> RelayResult<()> {
        info!("Initializing Kafka consumer...");
        let consumer = self.create_consumer()?;
        info!(
            topic = %self.queue.stream,
            group = %self.queue.group,
            consumer = %self.consumer_id,
            "Joined Kafka consumer group"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = consumer.recv() => received.map(|message| message.detach()),
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_PAUSE) => continue,
                    }
                }
            };

            let message_id = format!(
                "{}:{}:{}",
                message.topic(),
                message.partition(),
                message.offset()
            );

            let settlement = match message.payload().map(WorkItem::from_payload) {
                Some(Ok(item)) => self.settle(&handler, item, &message_id, &cancel).await,
                Some(Err(e)) => {
                    MALFORMED_DELIVERIES.inc();
                    warn!(error = %e, message_id = %message_id, "Discarding malformed work item");
                    Settlement::Discarded
                }
                None => {
                    MALFORMED_DELIVERIES.inc();
                    warn!(message_id = %message_id, "Discarding work item without payload");
                    Settlement::Discarded
                }
            };

            if settlement == Settlement::Abandoned {
                break;
            }
            self.commit(&consumer, &message);
        }

        info!(consumer = %self.consumer_id, "Left Kafka consumer group");
        Ok(())
    }
}
