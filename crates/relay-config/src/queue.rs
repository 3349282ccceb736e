// ============================================================================
// Work Queue Configuration
// ============================================================================
//
// One description of the durable work queue regardless of which broker
// carries it: stream name, subject, group name and delivery options.
//
// ============================================================================

use crate::constants::*;
use crate::{env_or, env_parse};
use anyhow::{Result, bail};
use std::str::FromStr;
use std::time::Duration;

/// Broker carrying the work queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueBackend {
    /// Redis Streams consumer groups (default)
    RedisStreams,
    /// Kafka topic + consumer group
    Kafka,
    /// In-process broker, single process only
    Memory,
}

impl FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" | "redis-streams" | "redis_streams" => Ok(Self::RedisStreams),
            "kafka" => Ok(Self::Kafka),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown queue backend '{}'", other),
        }
    }
}

impl std::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RedisStreams => "redis-streams",
            Self::Kafka => "kafka",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Where a newly created consumer group starts reading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Deliver everything retained in the stream
    All,
    /// Deliver only items published after the group was created
    New,
}

impl FromStr for DeliverPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "new" => Ok(Self::New),
            other => bail!("unknown deliver policy '{}'", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Stream (Redis key / Kafka topic) holding work items
    pub stream: String,
    /// Subject stamped on every published item
    pub subject: String,
    /// Competing-consumer group name shared by all workers
    pub group: String,
    /// Time a delivered item may stay unacknowledged before redelivery
    pub ack_wait: Duration,
    /// Maximum delivery attempts per item
    pub max_deliver: u32,
    pub deliver_policy: DeliverPolicy,
    /// Retention ceiling for unacknowledged items
    pub max_age: Duration,
    /// Items fetched per read
    pub read_batch: usize,
    /// How long a read blocks waiting for new items
    pub read_block: Duration,
    /// How often pending items are inspected for redelivery
    pub claim_interval: Duration,
}

impl QueueConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let config = Self {
            backend: env_parse("QUEUE_BACKEND", QueueBackend::RedisStreams)?,
            stream: env_or("QUEUE_STREAM", DEFAULT_QUEUE_STREAM),
            subject: env_or("QUEUE_SUBJECT", DEFAULT_QUEUE_SUBJECT),
            group: env_or("QUEUE_GROUP", DEFAULT_QUEUE_GROUP),
            ack_wait: Duration::from_millis(env_parse("QUEUE_ACK_WAIT_MS", DEFAULT_ACK_WAIT_MS)?),
            max_deliver: env_parse("QUEUE_MAX_DELIVER", DEFAULT_MAX_DELIVER)?,
            deliver_policy: env_parse("QUEUE_DELIVER_POLICY", DeliverPolicy::All)?,
            max_age: Duration::from_secs(env_parse("QUEUE_MAX_AGE_SECS", DEFAULT_MAX_AGE_SECS)?),
            read_batch: env_parse("QUEUE_READ_BATCH", DEFAULT_READ_BATCH)?,
            read_block: Duration::from_millis(env_parse(
                "QUEUE_READ_BLOCK_MS",
                DEFAULT_READ_BLOCK_MS,
            )?),
            claim_interval: Duration::from_millis(env_parse(
                "QUEUE_CLAIM_INTERVAL_MS",
                DEFAULT_CLAIM_INTERVAL_MS,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_deliver == 0 {
            bail!("QUEUE_MAX_DELIVER must be at least 1");
        }
        if self.ack_wait.is_zero() {
            bail!("QUEUE_ACK_WAIT_MS must be greater than zero");
        }
        if self.max_age.is_zero() {
            bail!("QUEUE_MAX_AGE_SECS must be greater than zero");
        }
        if self.read_batch == 0 {
            bail!("QUEUE_READ_BATCH must be at least 1");
        }
        if self.stream.is_empty() || self.group.is_empty() {
            bail!("QUEUE_STREAM and QUEUE_GROUP must not be empty");
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::RedisStreams,
            stream: DEFAULT_QUEUE_STREAM.to_string(),
            subject: DEFAULT_QUEUE_SUBJECT.to_string(),
            group: DEFAULT_QUEUE_GROUP.to_string(),
            ack_wait: Duration::from_millis(DEFAULT_ACK_WAIT_MS),
            max_deliver: DEFAULT_MAX_DELIVER,
            deliver_policy: DeliverPolicy::All,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            read_batch: DEFAULT_READ_BATCH,
            read_block: Duration::from_millis(DEFAULT_READ_BLOCK_MS),
            claim_interval: Duration::from_millis(DEFAULT_CLAIM_INTERVAL_MS),
        }
    }
}
