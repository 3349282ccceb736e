// ============================================================================
// Relay Pipeline Integration Tests (in-memory)
// ============================================================================
//
// Whole-pipeline behaviour with several listener and worker "processes" in
// one runtime. Time is paused, so TTLs, dedup windows and ack deadlines run
// on the tokio clock.
//
// ============================================================================


use async_trait::async_trait;
use relay_config::GeneratorConfig;
use relay_shared::{
    Delivery, EventHandler, GenerationRun, HandleOutcome, KeyGenerator, PipelineCounters,
    TtlStore, WorkPublisher,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::*;

/// Remembers every delivery attempt and answers per attempt number
struct Scripted {
    seen: Mutex<Vec<(String, u32)>>,
    ack_from_attempt: Option<u32>,
    hang_below: bool,
}

impl Scripted {
    fn new(ack_from_attempt: Option<u32>, hang_below: bool) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            ack_from_attempt,
            hang_below,
        })
    }

    fn attempts(&self) -> Vec<u32> {
        self.seen.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }
}

#[async_trait]
impl EventHandler<Delivery> for Scripted {
    type Outcome = HandleOutcome;

    async fn handle(&self, delivery: Delivery) -> HandleOutcome {
        self.seen
            .lock()
            .unwrap()
            .push((delivery.item.key.clone(), delivery.attempt));

        match self.ack_from_attempt {
            Some(first) if delivery.attempt >= first => HandleOutcome::Ack,
            _ if self.hang_below => std::future::pending().await,
            _ => HandleOutcome::Retry,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_each_expiration_is_consumed_exactly_once() {
    let mut cluster = MemoryCluster::new(queue_config());
    cluster.spawn_listener();
    cluster.spawn_listener();
    cluster.spawn_worker("worker-a");
    cluster.spawn_worker("worker-b");
    settle().await;

    let generator = KeyGenerator::new(cluster.keyspace.clone(), cluster.counters.clone(), "gen-key:");
    let params = GeneratorConfig {
        num_keys: 42,
        key_delay: Duration::from_millis(1),
        key_ttl: Duration::from_millis(100),
        op_timeout: Duration::from_secs(1),
    };
    let report = generator
        .run(&GenerationRun::new(), &params, &cluster.cancel)
        .await
        .unwrap();
    assert_eq!(report.written, 42);

    let counters = cluster.counters.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let counters = counters.clone();
            async move { counters.snapshot().await.unwrap().consumed == 42 }
        })
        .await
    );

    let stats = cluster.broker.stats();
    assert_eq!(stats.published, 42);
    assert_eq!(stats.deliveries, 42);
    assert_eq!(stats.acked, 42);
    assert_eq!(stats.exhausted, 0);

    let snapshot = cluster.counters.snapshot().await.unwrap();
    assert_eq!(snapshot.generated, 42);
    assert_eq!(snapshot.per_worker_total(), 42);

    // Dedup markers expire after the window; their notifications must not
    // turn into work
    tokio::time::sleep(DEDUP_WINDOW + Duration::from_secs(1)).await;
    assert_eq!(cluster.broker.stats().published, 42);
    assert_eq!(cluster.counters.snapshot().await.unwrap().consumed, 42);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_item_is_delivered_at_most_max_deliver_times() {
    let mut cluster = MemoryCluster::new(queue_config());
    let handler = Scripted::new(None, false);
    cluster.spawn_member("worker-a", handler.clone());
    settle().await;

    cluster.broker.publish("gen-key:stuck").await.unwrap();

    // Three ack deadlines and then some
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(handler.attempts(), vec![1, 2, 3]);
    let stats = cluster.broker.stats();
    assert_eq!(stats.deliveries, 3);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.outstanding, 0);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_item_is_redelivered_after_a_member_stalls() {
    let mut cluster = MemoryCluster::new(queue_config());
    // First attempt never completes, as if the worker died mid-handler
    let handler = Scripted::new(Some(2), true);
    cluster.spawn_member("worker-a", handler.clone());
    cluster.spawn_member("worker-b", handler.clone());
    settle().await;

    cluster.broker.publish("gen-key:1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(handler.attempts(), vec![1]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handler.attempts(), vec![1, 2]);

    let stats = cluster.broker.stats();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.exhausted, 0);
    assert_eq!(stats.outstanding, 0);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_listener_recovers_after_connection_loss() {
    let mut cluster = MemoryCluster::new(queue_config());
    cluster.spawn_listener();
    cluster.spawn_worker("worker-a");
    settle().await;

    cluster.keyspace.drop_subscriptions();
    settle().await;

    // Expires during the reconnect gap: lost
    cluster
        .keyspace
        .put_with_ttl("gen-key:gap", "0", Duration::from_millis(100))
        .await
        .unwrap();
    // Expires once the listener is back
    cluster
        .keyspace
        .put_with_ttl("gen-key:late", "1", RECONNECT_BACKOFF + Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(RECONNECT_BACKOFF + Duration::from_secs(2)).await;

    let stats = cluster.broker.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(cluster.keyspace.subscriber_count(), 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_key_is_forwarded_once_per_window() {
    let mut cluster = MemoryCluster::new(queue_config());
    cluster.spawn_listener();
    cluster.spawn_listener();
    cluster.spawn_worker("worker-a");
    settle().await;

    let ttl = Duration::from_millis(100);
    cluster.keyspace.put_with_ttl("gen-key:x", "x", ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.broker.stats().published, 1);

    // Expires again inside the window: suppressed
    cluster.keyspace.put_with_ttl("gen-key:x", "x", ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.broker.stats().published, 1);

    // After the window the same key is a new forward
    tokio::time::sleep(DEDUP_WINDOW).await;
    cluster.keyspace.put_with_ttl("gen-key:x", "x", ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.broker.stats().published, 2);

    cluster.shutdown().await;
}
