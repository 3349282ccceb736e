//! Redis client implementation with connection management

use crate::Result;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::time::Duration;

/// Redis client with automatic reconnection
///
/// Commands go through a [`ConnectionManager`]; pub/sub needs its own
/// connection, so the originating [`redis::Client`] is kept as well.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to Redis server
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Open a second managed connection to the same server
    ///
    /// Blocking commands (XREADGROUP BLOCK) stall every request multiplexed on
    /// their connection, so long-polling readers get their own.
    pub async fn dedicated(&self) -> Result<Self> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        tracing::debug!("Opened dedicated Redis connection");
        Ok(Self {
            client: self.client.clone(),
            conn,
        })
    }

    /// Underlying client, for opening dedicated connections
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }

    /// PING - verify connectivity
    pub async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    // ============================================================================
    // Key-Value Operations
    // ============================================================================

    /// GET - Get value by key
    pub async fn get<T: redis::FromRedisValue>(&mut self, key: &str) -> Result<Option<T>> {
        self.conn.get(key).await
    }

    /// SET PX - Set key with a millisecond expiry
    pub async fn set_px<V>(&mut self, key: &str, value: V, ttl: Duration) -> Result<()>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn)
            .await
    }

    /// SET NX PX - Set key only if it does not exist, with a millisecond expiry
    ///
    /// Returns `true` when this call created the key. The check and the write
    /// are a single atomic command on the server.
    pub async fn set_nx_px<V>(&mut self, key: &str, value: V, ttl: Duration) -> Result<bool>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.is_some())
    }

    /// DEL - Delete one or more keys
    pub async fn del<K>(&mut self, keys: K) -> Result<i64>
    where
        K: redis::ToRedisArgs + Send + Sync,
    {
        self.conn.del(keys).await
    }

    /// PTTL - Remaining time to live in milliseconds (-2 missing, -1 no expiry)
    pub async fn pttl(&mut self, key: &str) -> Result<i64> {
        self.conn.pttl(key).await
    }

    /// SCAN MATCH - Collect every key matching a glob pattern
    ///
    /// Uses cursor iteration so large keyspaces never block the server the
    /// way KEYS would.
    pub async fn scan_match(&mut self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut self.conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    // ============================================================================
    // Atomic Operations
    // ============================================================================

    /// INCR - Increment integer value
    pub async fn incr(&mut self, key: &str) -> Result<i64> {
        self.conn.incr(key, 1).await
    }

    /// INCR + PEXPIRE in one transaction, returning the new value
    pub async fn incr_with_ttl(&mut self, key: &str, ttl: Duration) -> Result<i64> {
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .pexpire(key, ttl_millis(ttl) as i64)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        Ok(count)
    }

    /// Execute a prepared pipeline on the managed connection
    pub async fn exec_pipeline<T: redis::FromRedisValue>(
        &mut self,
        pipe: &redis::Pipeline,
    ) -> Result<T> {
        pipe.query_async(&mut self.conn).await
    }
}

/// Redis rejects a zero expiry, so sub-millisecond TTLs round up to 1ms
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_set_nx_px_only_first_wins() -> Result<()> {
        let mut client = RedisClient::connect(&redis_url()).await?;
        client.del("relay_test:nx").await?;

        assert!(client.set_nx_px("relay_test:nx", 1, Duration::from_secs(5)).await?);
        assert!(!client.set_nx_px("relay_test:nx", 1, Duration::from_secs(5)).await?);

        let ttl = client.pttl("relay_test:nx").await?;
        assert!(ttl > 0 && ttl <= 5000);

        client.del("relay_test:nx").await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_scan_match_and_counters() -> Result<()> {
        let mut client = RedisClient::connect(&redis_url()).await?;
        client.del(&["relay_test:c:a", "relay_test:c:b"]).await?;

        client.incr("relay_test:c:a").await?;
        client.incr("relay_test:c:a").await?;
        client.incr("relay_test:c:b").await?;

        let keys = client.scan_match("relay_test:c:*").await?;
        assert_eq!(keys, vec!["relay_test:c:a", "relay_test:c:b"]);

        let a: Option<i64> = client.get("relay_test:c:a").await?;
        assert_eq!(a, Some(2));

        client.del(keys).await?;
        Ok(())
    }
}
