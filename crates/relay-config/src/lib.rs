// ============================================================================
// Relay Config - Centralized configuration management
// ============================================================================
//
// Configuration for every expiry-relay process, loaded from environment
// variables (and an optional .env file) with defaults matching the
// reference deployment.
//
// ============================================================================

mod constants;
mod kafka;
mod logging;
mod pipeline;
mod queue;
mod redis;

pub use constants::{
    DEFAULT_DEDUP_PREFIX, DEFAULT_GEN_KEY_PREFIX, SECONDS_PER_DAY, SECONDS_PER_HOUR,
    SECONDS_PER_MINUTE,
};
pub use kafka::KafkaConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use pipeline::{DedupConfig, GeneratorConfig, ListenerConfig, RolesConfig};
pub use queue::{DeliverPolicy, QueueBackend, QueueConfig};
pub use redis::{RedisChannels, RedisKeyPrefixes};

use anyhow::{Context, Result};
use std::str::FromStr;

/// Main configuration structure for expiry-relay processes
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,

    /// Identity of this process inside the consumer group.
    /// Only used for per-worker counters and logs; the broker owns routing.
    pub consumer_id: String,

    // Sub-configurations
    pub logging: LoggingConfig,
    pub roles: RolesConfig,
    pub dedup: DedupConfig,
    pub listener: ListenerConfig,
    pub queue: QueueConfig,
    pub kafka: KafkaConfig,
    pub generator: GeneratorConfig,
    pub redis_key_prefixes: RedisKeyPrefixes,
    pub redis_channels: RedisChannels,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            redis_url: env_or("REDIS_URL", constants::DEFAULT_REDIS_URL),
            consumer_id: resolve_consumer_id(),
            logging: LoggingConfig::from_env().context("invalid logging configuration")?,
            roles: RolesConfig::from_env().context("invalid RELAY_ROLES")?,
            dedup: DedupConfig::from_env().context("invalid dedup configuration")?,
            listener: ListenerConfig::from_env().context("invalid listener configuration")?,
            queue: QueueConfig::from_env().context("invalid queue configuration")?,
            kafka: KafkaConfig::from_env().context("invalid Kafka configuration")?,
            generator: GeneratorConfig::from_env().context("invalid generator configuration")?,
            redis_key_prefixes: RedisKeyPrefixes::from_env(),
            redis_channels: RedisChannels::from_env(),
        })
    }

    /// Redis URL with credentials masked, safe to log
    pub fn redis_url_for_logging(&self) -> String {
        mask_url_credentials(&self.redis_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: constants::DEFAULT_REDIS_URL.to_string(),
            consumer_id: "unknown".to_string(),
            logging: LoggingConfig::default(),
            roles: RolesConfig::default(),
            dedup: DedupConfig::default(),
            listener: ListenerConfig::default(),
            queue: QueueConfig::default(),
            kafka: KafkaConfig::default(),
            generator: GeneratorConfig::default(),
            redis_key_prefixes: RedisKeyPrefixes::default(),
            redis_channels: RedisChannels::default(),
        }
    }
}

/// CONSUMER_ID, then HOSTNAME (the pod name under Kubernetes), then "unknown"
fn resolve_consumer_id() -> String {
    env_opt("CONSUMER_ID")
        .or_else(|| env_opt("HOSTNAME"))
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) fn mask_url_credentials(url: &str) -> String {
    match url.find('@') {
        Some(at_pos) => {
            let protocol_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            format!("{}***{}", &url[..protocol_end], &url[at_pos..])
        }
        None => url.to_string(),
    }
}

pub(crate) fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional variable, failing loudly on a malformed value
pub(crate) fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}={:?} is invalid: {}", name, raw, e)),
        None => Ok(default),
    }
}
