// ============================================================================
// Kafka Configuration
// ============================================================================

use crate::{env_opt, env_or, env_parse};
use anyhow::Result;

/// Kafka connection and producer tuning, used when `QUEUE_BACKEND=kafka`.
///
/// Topic and consumer group names come from [`crate::QueueConfig`] so both
/// backends are addressed the same way.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Comma-separated list of Kafka brokers (e.g., "kafka1:9092,kafka2:9092")
    pub brokers: String,
    /// Partitions used when the topic has to be created
    pub partitions: i32,
    /// Replication factor used when the topic has to be created
    pub replication_factor: i32,
    /// SSL/TLS enabled
    pub ssl_enabled: bool,
    /// SASL mechanism (e.g., "SCRAM-SHA-256", "PLAIN")
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Path to CA certificate file (for self-signed certificates)
    pub ssl_ca_location: Option<String>,
    // producer-specific settings
    pub producer_compression: String, // "zstd" | "snappy" | "gzip" | "lz4" | "none"
    pub producer_acks: String,        // "all" | "1" | "-1" | "0"
    pub producer_linger_ms: u32,
    pub producer_request_timeout_ms: u32,
    pub producer_delivery_timeout_ms: u32,
    pub producer_enable_idempotence: bool,
}

impl KafkaConfig {
    pub(crate) fn from_env() -> Result<Self> {
        Ok(Self {
            brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
            partitions: env_parse("KAFKA_TOPIC_PARTITIONS", 6)?,
            replication_factor: env_parse("KAFKA_TOPIC_REPLICATION", 1)?,
            ssl_enabled: env_parse("KAFKA_SSL_ENABLED", false)?,
            sasl_mechanism: env_opt("KAFKA_SASL_MECHANISM"),
            sasl_username: env_opt("KAFKA_SASL_USERNAME"),
            sasl_password: env_opt("KAFKA_SASL_PASSWORD"),
            ssl_ca_location: env_opt("KAFKA_SSL_CA_LOCATION"),
            producer_compression: env_or("KAFKA_PRODUCER_COMPRESSION", "snappy"),
            producer_acks: env_or("KAFKA_PRODUCER_ACKS", "all"),
            producer_linger_ms: env_parse("KAFKA_PRODUCER_LINGER_MS", 10)?,
            producer_request_timeout_ms: env_parse("KAFKA_PRODUCER_REQUEST_TIMEOUT_MS", 30_000)?,
            producer_delivery_timeout_ms: env_parse("KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS", 120_000)?,
            producer_enable_idempotence: env_parse("KAFKA_PRODUCER_ENABLE_IDEMPOTENCE", true)?,
        })
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            partitions: 6,
            replication_factor: 1,
            ssl_enabled: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            producer_compression: "snappy".to_string(),
            producer_acks: "all".to_string(),
            producer_linger_ms: 10,
            producer_request_timeout_ms: 30_000,
            producer_delivery_timeout_ms: 120_000,
            producer_enable_idempotence: true,
        }
    }
}
