//! Redis Streams support
//!
//! Consumer-group primitives: group creation, group reads, acknowledgment,
//! pending inspection and claiming.

use crate::client::ttl_millis;
use crate::{RedisClient, Result};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions as RawReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Entry in a Redis Stream (string values)
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    fn from_stream_id(stream_id: StreamId) -> Self {
        let mut fields = HashMap::new();
        for (key, value) in stream_id.map {
            let value_str = match value {
                Value::BulkString(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Value::SimpleString(s) => s,
                Value::Int(i) => i.to_string(),
                _ => continue, // Skip unsupported types
            };
            fields.insert(key, value_str);
        }
        Self {
            id: stream_id.id,
            fields,
        }
    }
}

/// One entry of the consumer group's pending entries list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub times_delivered: u64,
}

/// Options for XREADGROUP
#[derive(Debug, Clone, Default)]
pub struct StreamReadOptions {
    /// Block for N milliseconds (None = no blocking)
    pub block: Option<u64>,
    /// Maximum number of entries to return
    pub count: Option<usize>,
}

impl RedisClient {
    // ============================================================================
    // Stream Operations
    // ============================================================================

    /// XADD with MINID trimming - append an entry and drop entries older than `max_age`
    ///
    /// Stream IDs start with the insertion time in milliseconds, so trimming by
    /// MINID `now - max_age` is an age-based retention ceiling.
    pub async fn xadd_with_max_age(
        &mut self,
        stream_key: &str,
        fields: &[(&str, &str)],
        max_age: Duration,
        now_ms: u64,
    ) -> Result<String> {
        let min_id = now_ms.saturating_sub(ttl_millis(max_age));

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key)
            .arg("MINID")
            .arg("~") // Approximate trimming
            .arg(min_id)
            .arg("*"); // Auto-generate ID (timestamp-sequence)
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async(self.connection_mut()).await
    }

    /// XGROUP CREATE ... MKSTREAM
    ///
    /// Returns `false` when the group already exists (BUSYGROUP), which makes
    /// concurrent creation from many processes safe.
    pub async fn xgroup_create_if_missing(
        &mut self,
        stream_key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool> {
        let created: Result<()> = self
            .connection_mut()
            .xgroup_create_mkstream(stream_key, group, start_id)
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// XREADGROUP ... STREAMS key > - read entries never delivered to the group
    pub async fn xreadgroup_new(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        options: StreamReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let mut raw = RawReadOptions::default().group(group, consumer);
        if let Some(count) = options.count {
            raw = raw.count(count);
        }
        if let Some(block_ms) = options.block {
            raw = raw.block(block_ms as usize);
        }

        let reply: Option<StreamReadReply> = self
            .connection_mut()
            .xread_options(&[stream_key], &[">"], &raw)
            .await?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(StreamEntry::from_stream_id)
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    /// XACK + XDEL in one transaction - acknowledge and remove entries
    ///
    /// Work-queue retention: an acknowledged entry has no further readers.
    pub async fn xack_and_delete(
        &mut self,
        stream_key: &str,
        group: &str,
        ids: &[&str],
    ) -> Result<i64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (acked,): (i64,) = redis::pipe()
            .atomic()
            .xack(stream_key, group, ids)
            .xdel(stream_key, ids)
            .ignore()
            .query_async(self.connection_mut())
            .await?;
        Ok(acked)
    }

    /// XPENDING key group - + count - oldest pending entries of the group
    pub async fn xpending_entries(
        &mut self,
        stream_key: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let reply: StreamPendingCountReply = self
            .connection_mut()
            .xpending_count(stream_key, group, "-", "+", count)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                times_delivered: p.times_delivered as u64,
            })
            .collect())
    }

    /// XCLAIM - take ownership of entries idle for at least `min_idle`
    ///
    /// Only entries still idle on the server are returned, so two consumers
    /// racing for the same entry never both receive it. Each claim bumps the
    /// entry's delivery counter.
    pub async fn xclaim_idle(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[&str],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: StreamClaimReply = self
            .connection_mut()
            .xclaim(stream_key, group, consumer, ttl_millis(min_idle), ids)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(StreamEntry::from_stream_id)
            .collect())
    }

    /// XLEN - number of entries currently in the stream
    pub async fn xlen(&mut self, stream_key: &str) -> Result<u64> {
        self.connection_mut().xlen(stream_key).await
    }
}
