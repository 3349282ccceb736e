// ============================================================================
// Redis Configuration
// ============================================================================

use crate::constants::*;
use crate::env_or;

/// Redis key prefixes configuration
#[derive(Clone, Debug)]
pub struct RedisKeyPrefixes {
    /// Prefix for dedup claim markers: "dedup:{original_key}"
    pub dedup: String,
    /// Prefix for TTL-bearing records written by the load generator: "gen-key:{seq}"
    pub gen_key: String,
    /// Counter of generated keys
    pub metrics_generated: String,
    /// Counter of consumed work items
    pub metrics_consumed: String,
    /// Prefix for per-worker consumed counters: "metrics:consumer:{consumer_id}"
    pub metrics_consumer: String,
    /// Prefix for Kafka delivery attempt counters: "retry_count:{topic}:{partition}:{offset}"
    pub retry_count: String,
}

impl RedisKeyPrefixes {
    pub(crate) fn from_env() -> Self {
        Self {
            dedup: env_or("REDIS_KEY_PREFIX_DEDUP", DEFAULT_DEDUP_PREFIX),
            gen_key: env_or("REDIS_KEY_PREFIX_GEN_KEY", DEFAULT_GEN_KEY_PREFIX),
            metrics_generated: env_or("REDIS_KEY_METRICS_GENERATED", DEFAULT_METRICS_GENERATED_KEY),
            metrics_consumed: env_or("REDIS_KEY_METRICS_CONSUMED", DEFAULT_METRICS_CONSUMED_KEY),
            metrics_consumer: env_or(
                "REDIS_KEY_PREFIX_METRICS_CONSUMER",
                DEFAULT_METRICS_CONSUMER_PREFIX,
            ),
            retry_count: env_or("REDIS_KEY_PREFIX_RETRY_COUNT", DEFAULT_RETRY_COUNT_PREFIX),
        }
    }
}

impl Default for RedisKeyPrefixes {
    fn default() -> Self {
        Self {
            dedup: DEFAULT_DEDUP_PREFIX.to_string(),
            gen_key: DEFAULT_GEN_KEY_PREFIX.to_string(),
            metrics_generated: DEFAULT_METRICS_GENERATED_KEY.to_string(),
            metrics_consumed: DEFAULT_METRICS_CONSUMED_KEY.to_string(),
            metrics_consumer: DEFAULT_METRICS_CONSUMER_PREFIX.to_string(),
            retry_count: DEFAULT_RETRY_COUNT_PREFIX.to_string(),
        }
    }
}

/// Redis channel names configuration
#[derive(Clone, Debug)]
pub struct RedisChannels {
    /// Keyspace notification channel carrying expired key names.
    /// Requires `notify-keyspace-events Ex` on the server.
    pub expired: String,
}

impl RedisChannels {
    pub(crate) fn from_env() -> Self {
        Self {
            expired: env_or("REDIS_CHANNEL_EXPIRED", DEFAULT_EXPIRED_CHANNEL),
        }
    }
}

impl Default for RedisChannels {
    fn default() -> Self {
        Self {
            expired: DEFAULT_EXPIRED_CHANNEL.to_string(),
        }
    }
}
