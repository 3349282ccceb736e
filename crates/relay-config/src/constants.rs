// ============================================================================
// Configuration Constants
// ============================================================================

// Expiration feed
pub(crate) const DEFAULT_EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";
pub(crate) const DEFAULT_REDIS_URL: &str = "redis://redis:6379";

// Key namespaces
pub const DEFAULT_DEDUP_PREFIX: &str = "dedup:";
pub const DEFAULT_GEN_KEY_PREFIX: &str = "gen-key:";
pub(crate) const DEFAULT_METRICS_GENERATED_KEY: &str = "metrics:generated";
pub(crate) const DEFAULT_METRICS_CONSUMED_KEY: &str = "metrics:consumed";
pub(crate) const DEFAULT_METRICS_CONSUMER_PREFIX: &str = "metrics:consumer:";
pub(crate) const DEFAULT_RETRY_COUNT_PREFIX: &str = "retry_count:";

// Timing (milliseconds)
pub(crate) const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;
pub(crate) const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;
pub(crate) const DEFAULT_ACK_WAIT_MS: u64 = 5_000;
pub(crate) const DEFAULT_READ_BLOCK_MS: u64 = 1_000;
pub(crate) const DEFAULT_CLAIM_INTERVAL_MS: u64 = 1_000;

// Work queue
pub(crate) const DEFAULT_QUEUE_STREAM: &str = "WORKGROUPPOLICY";
pub(crate) const DEFAULT_QUEUE_SUBJECT: &str = "Stream.Workgroup.Policy.Events";
pub(crate) const DEFAULT_QUEUE_GROUP: &str = "key_expiration_processors";
pub(crate) const DEFAULT_MAX_DELIVER: u32 = 3;
pub(crate) const DEFAULT_READ_BATCH: usize = 32;

// Time conversion constants
pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 3600;
pub const SECONDS_PER_DAY: u64 = 86400;

// Work items older than this are trimmed from the queue
pub(crate) const DEFAULT_MAX_AGE_SECS: u64 = SECONDS_PER_DAY;

// Generator
pub(crate) const DEFAULT_GENERATOR_NUM_KEYS: u64 = 1_000;
pub(crate) const DEFAULT_GENERATOR_KEY_DELAY_MS: u64 = 10;
pub(crate) const DEFAULT_GENERATOR_KEY_TTL_MS: u64 = 1_000;
pub(crate) const DEFAULT_GENERATOR_OP_TIMEOUT_MS: u64 = 2_000;
