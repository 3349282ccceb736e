//! Pub/Sub support
//!
//! Subscriptions need a dedicated connection; the managed command connection
//! cannot enter subscriber mode.

use crate::{RedisClient, Result};
use redis::aio::PubSub;

impl RedisClient {
    /// Open a fresh pub/sub connection subscribed to `channel`
    ///
    /// Every call creates a new connection, so a broken subscription is
    /// replaced by dropping it and calling this again.
    pub async fn subscribe(&self, channel: &str) -> Result<PubSub> {
        let mut pubsub = self.client().get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        tracing::debug!(channel = %channel, "Subscribed to Redis channel");
        Ok(pubsub)
    }

    /// PUBLISH - Send a message to a channel, returning the receiver count
    pub async fn publish(&mut self, channel: &str, payload: &str) -> Result<i64> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(self.connection_mut())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_subscribe_receives_published_payload() -> Result<()> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let mut client = RedisClient::connect(&url).await?;

        let pubsub = client.subscribe("relay_test:channel").await?;
        let mut messages = pubsub.into_on_message();

        client.publish("relay_test:channel", "gen-key:7").await?;

        let msg = tokio::time::timeout(Duration::from_secs(2), messages.next())
            .await
            .expect("no message within 2s")
            .expect("stream ended");
        let payload: String = msg.get_payload()?;
        assert_eq!(payload, "gen-key:7");
        Ok(())
    }
}
