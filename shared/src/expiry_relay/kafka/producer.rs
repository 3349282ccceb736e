use super::config::create_client_config;
use crate::events::WorkItem;
use crate::queue::{CircuitBreaker, CircuitBreakerConfig, WorkPublisher};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use relay_config::{KafkaConfig, QueueConfig};
use relay_error::{RelayError, RelayResult};
use relay_metrics::{EVENTS_PUBLISHED, PUBLISH_FAILURES, PUBLISH_LATENCY};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// How long `send` may wait for room in the local producer queue
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) fn kafka_error(e: KafkaError) -> RelayError {
    RelayError::Kafka(e.to_string())
}

/// Work queue producer on a Kafka topic
///
/// - `acks` / idempotence / compression from `KafkaConfig`
/// - partition key is the expired key, so redeliveries of one key stay ordered
/// - every send goes through a circuit breaker (5 failures, 3s, 30s reset)
pub struct KafkaWorkPublisher {
    producer: FutureProducer,
    client_config: ClientConfig,
    queue: QueueConfig,
    partitions: i32,
    replication_factor: i32,
    ensured: OnceCell<()>,
    breaker: CircuitBreaker,
}

impl KafkaWorkPublisher {
    pub fn new(kafka: &KafkaConfig, queue: QueueConfig) -> RelayResult<Self> {
        info!(brokers = %kafka.brokers, topic = %queue.stream, "Initializing Kafka producer...");
        let client_config = create_client_config(kafka);

        let producer: FutureProducer = client_config
            .clone()
            .set("acks", &kafka.producer_acks)
            .set(
                "enable.idempotence",
                if kafka.producer_enable_idempotence {
                    "true"
                } else {
                    "false"
                },
            )
            .set("compression.type", &kafka.producer_compression)
            .set("linger.ms", kafka.producer_linger_ms.to_string())
            .set(
                "request.timeout.ms",
                kafka.producer_request_timeout_ms.to_string(),
            )
            .set(
                "delivery.timeout.ms",
                kafka.producer_delivery_timeout_ms.to_string(),
            )
            .create()
            .map_err(kafka_error)?;

        Ok(Self {
            producer,
            client_config,
            queue,
            partitions: kafka.partitions,
            replication_factor: kafka.replication_factor,
            ensured: OnceCell::new(),
            breaker: CircuitBreaker::new("kafka", CircuitBreakerConfig::default()),
        })
    }

    async fn create_topic(&self) -> RelayResult<()> {
        let admin: AdminClient<DefaultClientContext> =
            self.client_config.create().map_err(kafka_error)?;

        let retention_ms = self.queue.max_age.as_millis().to_string();
        let topic = NewTopic::new(
            &self.queue.stream,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        )
        .set("retention.ms", &retention_ms);
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = admin
            .create_topics(&[topic], &options)
            .await
            .map_err(kafka_error)?;

        for result in results {
            match result {
                Ok(name) => {
                    info!(topic = %name, retention_ms = %retention_ms, "Created work queue topic");
                }
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Work queue topic already exists");
                }
                Err((name, code)) => {
                    return Err(RelayError::Kafka(format!(
                        "failed to create topic '{}': {}",
                        name, code
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkPublisher for KafkaWorkPublisher {
    async fn ensure_stream(&self) -> RelayResult<()> {
        self.ensured.get_or_try_init(|| self.create_topic()).await?;
        Ok(())
    }

    async fn publish(&self, key: &str) -> RelayResult<String> {
        self.ensure_stream().await?;
        let payload = WorkItem::new(key).to_payload()?;
        let topic = self.queue.stream.as_str();

        let timer = PUBLISH_LATENCY.start_timer();
        let result = self
            .breaker
            .call(async {
                let record = FutureRecord::to(topic).key(key).payload(&payload);
                self.producer
                    .send(record, Timeout::After(ENQUEUE_TIMEOUT))
                    .await
                    .map(|(partition, offset)| format!("{}:{}:{}", topic, partition, offset))
                    .map_err(|(e, _)| kafka_error(e))
            })
            .await;
        timer.observe_duration();

        match &result {
            Ok(message_id) => {
                EVENTS_PUBLISHED.inc();
                debug!(key = %key, message_id = %message_id, "Work item persisted to Kafka");
            }
            Err(e) => {
                PUBLISH_FAILURES.inc();
                error!(error = %e, key = %key, topic = %topic, "Failed to send work item to Kafka");
            }
        }
        result
    }
}
