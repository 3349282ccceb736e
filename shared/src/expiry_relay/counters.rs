// ============================================================================
// Pipeline Counters
// ============================================================================
//
// Shared counters read by whoever watches a load run:
//
//   metrics:generated            keys written by the load generator
//   metrics:consumed             work items handled across the group
//   metrics:consumer:<id>        work items handled by one worker
//
// These live in the shared store (not in the process-local Prometheus
// registry) so every worker contributes to the same totals.
//
// ============================================================================

use async_trait::async_trait;
use relay_config::RedisKeyPrefixes;
use relay_error::RelayResult;
use relay_redis::RedisClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::info;

/// Point-in-time view of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub generated: i64,
    pub consumed: i64,
    /// Consumed items by worker id
    pub per_worker: BTreeMap<String, i64>,
}

impl CounterSnapshot {
    /// Sum of the per-worker counters
    pub fn per_worker_total(&self) -> i64 {
        self.per_worker.values().sum()
    }
}

#[async_trait]
pub trait PipelineCounters: Send + Sync + 'static {
    async fn incr_generated(&self) -> RelayResult<i64>;
    async fn incr_consumed(&self) -> RelayResult<i64>;
    async fn incr_consumed_by(&self, worker: &str) -> RelayResult<i64>;
    async fn snapshot(&self) -> RelayResult<CounterSnapshot>;
    /// Zero both totals and forget every per-worker counter
    async fn reset(&self) -> RelayResult<()>;
}

#[derive(Clone)]
pub struct RedisCounters {
    redis: RedisClient,
    generated_key: String,
    consumed_key: String,
    worker_prefix: String,
}

impl RedisCounters {
    pub fn new(redis: RedisClient, prefixes: &RedisKeyPrefixes) -> Self {
        Self {
            redis,
            generated_key: prefixes.metrics_generated.clone(),
            consumed_key: prefixes.metrics_consumed.clone(),
            worker_prefix: prefixes.metrics_consumer.clone(),
        }
    }

    fn worker_key(&self, worker: &str) -> String {
        format!("{}{}", self.worker_prefix, worker)
    }

    async fn worker_keys(&self) -> RelayResult<Vec<String>> {
        let mut redis = self.redis.clone();
        Ok(redis.scan_match(&format!("{}*", self.worker_prefix)).await?)
    }
}

#[async_trait]
impl PipelineCounters for RedisCounters {
    async fn incr_generated(&self) -> RelayResult<i64> {
        let mut redis = self.redis.clone();
        Ok(redis.incr(&self.generated_key).await?)
    }

    async fn incr_consumed(&self) -> RelayResult<i64> {
        let mut redis = self.redis.clone();
        Ok(redis.incr(&self.consumed_key).await?)
    }

    async fn incr_consumed_by(&self, worker: &str) -> RelayResult<i64> {
        let mut redis = self.redis.clone();
        Ok(redis.incr(&self.worker_key(worker)).await?)
    }

    async fn snapshot(&self) -> RelayResult<CounterSnapshot> {
        let worker_keys = self.worker_keys().await?;

        let mut pipe = redis::pipe();
        pipe.get(&self.generated_key).get(&self.consumed_key);
        for key in &worker_keys {
            pipe.get(key);
        }

        let mut redis = self.redis.clone();
        let values: Vec<Option<i64>> = redis.exec_pipeline(&pipe).await?;
        let mut values = values.into_iter();

        let generated = values.next().flatten().unwrap_or(0);
        let consumed = values.next().flatten().unwrap_or(0);
        let per_worker = worker_keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let worker = key.strip_prefix(&self.worker_prefix)?;
                // Deleted between SCAN and GET
                Some((worker.to_string(), value?))
            })
            .collect();

        Ok(CounterSnapshot {
            generated,
            consumed,
            per_worker,
        })
    }

    async fn reset(&self) -> RelayResult<()> {
        let worker_keys = self.worker_keys().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(&self.generated_key, 0)
            .ignore()
            .set(&self.consumed_key, 0)
            .ignore();
        if !worker_keys.is_empty() {
            pipe.del(&worker_keys).ignore();
        }

        let mut redis = self.redis.clone();
        let () = redis.exec_pipeline(&pipe).await?;
        info!(
            workers_cleared = worker_keys.len(),
            "Pipeline counters reset"
        );
        Ok(())
    }
}

/// Process-local counters with the same semantics
#[derive(Default)]
pub struct MemoryCounters {
    generated: Mutex<i64>,
    consumed: Mutex<i64>,
    per_worker: Mutex<HashMap<String, i64>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &Mutex<i64>) -> i64 {
        let mut value = counter.lock().unwrap_or_else(|p| p.into_inner());
        *value += 1;
        *value
    }
}

#[async_trait]
impl PipelineCounters for MemoryCounters {
    async fn incr_generated(&self) -> RelayResult<i64> {
        Ok(Self::bump(&self.generated))
    }

    async fn incr_consumed(&self) -> RelayResult<i64> {
        Ok(Self::bump(&self.consumed))
    }

    async fn incr_consumed_by(&self, worker: &str) -> RelayResult<i64> {
        let mut per_worker = self.per_worker.lock().unwrap_or_else(|p| p.into_inner());
        let value = per_worker.entry(worker.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn snapshot(&self) -> RelayResult<CounterSnapshot> {
        let generated = *self.generated.lock().unwrap_or_else(|p| p.into_inner());
        let consumed = *self.consumed.lock().unwrap_or_else(|p| p.into_inner());
        let per_worker = self
            .per_worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(worker, count)| (worker.clone(), *count))
            .collect();
        Ok(CounterSnapshot {
            generated,
            consumed,
            per_worker,
        })
    }

    async fn reset(&self) -> RelayResult<()> {
        *self.generated.lock().unwrap_or_else(|p| p.into_inner()) = 0;
        *self.consumed.lock().unwrap_or_else(|p| p.into_inner()) = 0;
        self.per_worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_memory_counters_reset_is_idempotent() {
        let counters = MemoryCounters::new();
        counters.incr_generated().await.unwrap();
        counters.incr_consumed_by("worker-a").await.unwrap();
        counters.incr_consumed().await.unwrap();

        counters.reset().await.unwrap();
        counters.reset().await.unwrap();

        assert_eq!(counters.snapshot().await.unwrap(), CounterSnapshot::default());
    }

    #[tokio::test]
    async fn test_per_worker_counters_sum_to_total() {
        let counters = MemoryCounters::new();
        for worker in ["a", "b", "a", "c", "a"] {
            counters.incr_consumed_by(worker).await.unwrap();
            counters.incr_consumed().await.unwrap();
        }

        let snapshot = counters.snapshot().await.unwrap();
        assert_eq!(snapshot.consumed, 5);
        assert_eq!(snapshot.per_worker_total(), 5);
        assert_eq!(snapshot.per_worker.get("a"), Some(&3));
    }

    // Note: Requires a running Redis instance
    #[tokio::test]
    #[ignore] // Requires Redis
    #[serial]
    async fn test_redis_counters_snapshot_and_reset() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis = RedisClient::connect(&url).await.unwrap();
        let prefixes = RedisKeyPrefixes {
            metrics_generated: "relay_test:metrics:generated".to_string(),
            metrics_consumed: "relay_test:metrics:consumed".to_string(),
            metrics_consumer: "relay_test:metrics:consumer:".to_string(),
            ..RedisKeyPrefixes::default()
        };
        let counters = RedisCounters::new(redis, &prefixes);

        // Reset with no per-worker keys present
        counters.reset().await.unwrap();
        assert_eq!(counters.snapshot().await.unwrap(), CounterSnapshot::default());

        counters.incr_generated().await.unwrap();
        counters.incr_consumed_by("worker-a").await.unwrap();
        counters.incr_consumed().await.unwrap();

        let snapshot = counters.snapshot().await.unwrap();
        assert_eq!(snapshot.generated, 1);
        assert_eq!(snapshot.consumed, 1);
        assert_eq!(snapshot.per_worker.get("worker-a"), Some(&1));

        counters.reset().await.unwrap();
        assert_eq!(counters.snapshot().await.unwrap(), CounterSnapshot::default());
    }
}
