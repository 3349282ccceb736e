// ============================================================================
// Work Queue
// ============================================================================
//
// One adapter interface over the durable work queue, with the backend picked
// by configuration:
//
// - redis-streams (default): stream + consumer group on the same Redis the
//   relay already depends on
// - kafka: topic + consumer group, attempt counts kept in Redis
// - memory: in-process broker for tests and single-process runs
//
// Every backend provides the same contract:
// - publish appends one WorkItem; stream/group creation happens once, is
//   idempotent and safe when many processes race on first use
// - members of one group compete: each item goes to exactly one member at a
//   time
// - manual acknowledgment with an ack deadline; an unacknowledged item is
//   redelivered, at most `max_deliver` deliveries in total
// - a new group starts from the oldest retained item (deliver-all)
//
// ============================================================================

pub mod circuit_breaker;
pub mod memory;
pub mod redis_streams;

use crate::events::{ConsumerId, Delivery, HandleOutcome};
use crate::handler::EventHandler;
use crate::kafka::{KafkaConsumerGroup, KafkaWorkPublisher};
use async_trait::async_trait;
use relay_config::{Config, QueueBackend};
use relay_error::RelayResult;
use relay_redis::RedisClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use memory::{BrokerStats, MemoryBroker, MemoryMember};
pub use redis_streams::RedisStreamQueue;

/// Handler injected into a consumer group
pub type WorkHandler = dyn EventHandler<Delivery, Outcome = HandleOutcome>;

/// Producer side of the work queue
#[async_trait]
pub trait WorkPublisher: Send + Sync + 'static {
    /// Create the stream and consumer group if missing
    ///
    /// Idempotent. `publish` calls it on first use, so calling it explicitly
    /// only moves the cost (and a connectivity failure) to startup.
    async fn ensure_stream(&self) -> RelayResult<()>;

    /// Append a work item for `key`, returning the broker's message id
    ///
    /// Failures are returned to the caller; nothing is retried here.
    async fn publish(&self, key: &str) -> RelayResult<String>;
}

/// Consumer side: this process's membership in the consumer group
#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Receive deliveries and dispatch each to `handler` on its own task
    ///
    /// `Ack` outcomes are acknowledged; anything else leaves the item to be
    /// redelivered after the ack deadline. Returns once `cancel` fires, or with
    /// an error if the group cannot be joined at all.
    async fn run(&self, handler: Arc<WorkHandler>, cancel: CancellationToken) -> RelayResult<()>;
}

/// Both halves of the configured backend
pub struct WorkQueue {
    pub publisher: Arc<dyn WorkPublisher>,
    pub consumer: Arc<dyn ConsumerGroup>,
}

impl WorkQueue {
    /// Build the backend named by `config.queue.backend`
    ///
    /// `redis` backs the Redis Streams queue and, for Kafka, the attempt
    /// ledger.
    pub async fn connect(
        config: &Config,
        redis: &RedisClient,
        consumer_id: &ConsumerId,
    ) -> RelayResult<Self> {
        let queue = &config.queue;
        info!(
            backend = %queue.backend,
            stream = %queue.stream,
            group = %queue.group,
            ack_wait_ms = queue.ack_wait.as_millis() as u64,
            max_deliver = queue.max_deliver,
            "Configuring work queue"
        );

        match queue.backend {
            QueueBackend::RedisStreams => {
                let streams =
                    Arc::new(RedisStreamQueue::new(redis.clone(), queue.clone(), consumer_id.clone()));
                Ok(Self {
                    publisher: streams.clone(),
                    consumer: streams,
                })
            }
            QueueBackend::Kafka => Ok(Self {
                publisher: Arc::new(KafkaWorkPublisher::new(&config.kafka, queue.clone())?),
                consumer: Arc::new(KafkaConsumerGroup::new(
                    config.kafka.clone(),
                    queue.clone(),
                    consumer_id.clone(),
                    redis.clone(),
                    config.redis_key_prefixes.retry_count.clone(),
                )),
            }),
            QueueBackend::Memory => {
                let broker = MemoryBroker::new(queue.clone());
                Ok(Self {
                    consumer: Arc::new(broker.member(consumer_id.clone())),
                    publisher: Arc::new(broker),
                })
            }
        }
    }
}
