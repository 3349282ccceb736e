// ============================================================================
// Redis Keyspace Adapter
// ============================================================================
//
// Binds the pipeline's store-facing traits to a live Redis server:
// - ClaimStore       -> SET <key> 1 NX PX <ttl>
// - TtlStore         -> SET <key> <value> PX <ttl>
// - ExpirationSource -> SUBSCRIBE on a dedicated pub/sub connection
//
// Keyspace notifications must be enabled on the server
// (`notify-keyspace-events Ex`); `enable_expired_events` sets it for
// deployments that do not manage redis.conf.
//
// ============================================================================

use crate::dedup::ClaimStore;
use crate::generator::TtlStore;
use crate::listener::{ExpirationSource, NotificationStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use relay_error::{RelayError, RelayResult};
use relay_redis::RedisClient;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RedisKeyspace {
    redis: RedisClient,
}

impl RedisKeyspace {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    /// CONFIG SET notify-keyspace-events Ex
    ///
    /// Managed Redis offerings often forbid CONFIG; that is logged, not fatal,
    /// since the setting may already be in place.
    pub async fn enable_expired_events(&self) -> RelayResult<()> {
        let mut redis = self.redis.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(redis.connection_mut())
            .await;

        match result {
            Ok(()) => {
                info!("Enabled expired keyspace notifications (notify-keyspace-events=Ex)");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Could not enable keyspace notifications, assuming the server is preconfigured"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for RedisKeyspace {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> RelayResult<bool> {
        let mut redis = self.redis.clone();
        Ok(redis.set_nx_px(key, 1, ttl).await?)
    }
}

#[async_trait]
impl TtlStore for RedisKeyspace {
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let mut redis = self.redis.clone();
        Ok(redis.set_px(key, value, ttl).await?)
    }
}

#[async_trait]
impl ExpirationSource for RedisKeyspace {
    async fn subscribe(&self, channel: &str) -> RelayResult<NotificationStream> {
        let pubsub = self
            .redis
            .subscribe(channel)
            .await
            .map_err(|e| RelayError::Subscription(format!("SUBSCRIBE {}: {}", channel, e)))?;

        // The message stream ends when the pub/sub connection drops
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(RelayError::from));

        Ok(Box::pin(stream))
    }
}
