// ============================================================================
// Relay Pipeline Integration Tests (Redis)
// ============================================================================
//
// The same pipeline against a live Redis: keyspace notifications, SET NX
// claims, a Redis Streams work queue and Redis-backed counters.
//
// Run with: cargo test --test redis_pipeline_test -- --ignored
// (Tests are marked with #[ignore] to skip unless Redis is available)
//
// ============================================================================


use relay_config::{GeneratorConfig, QueueConfig, RedisKeyPrefixes};
use relay_redis::RedisClient;
use relay_shared::queue::RedisStreamQueue;
use relay_shared::{
    ConsumerGroup, ConsumerId, CountingHandler, DedupGate, ExpirationForwarder,
    ExpirationListener, GenerationRun, KeyGenerator, PipelineCounters, RedisCounters,
    RedisKeyspace, WorkHandler,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{EXPIRED_CHANNEL, wait_until};
use tokio_util::sync::CancellationToken;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn test_prefixes() -> RedisKeyPrefixes {
    RedisKeyPrefixes {
        dedup: "relay_test:dedup:".to_string(),
        gen_key: "relay_test:gen-key:".to_string(),
        metrics_generated: "relay_test:metrics:generated".to_string(),
        metrics_consumed: "relay_test:metrics:consumed".to_string(),
        metrics_consumer: "relay_test:metrics:consumer:".to_string(),
        retry_count: "relay_test:retry_count:".to_string(),
    }
}

#[tokio::test]
#[ignore] // Requires Redis
#[serial]
async fn test_expirations_flow_through_redis_exactly_once() {
    let mut redis = RedisClient::connect(&redis_url()).await.unwrap();
    redis.del("relay_test:work").await.unwrap();
    let prefixes = test_prefixes();

    let keyspace = Arc::new(RedisKeyspace::new(redis.clone()));
    keyspace.enable_expired_events().await.unwrap();
    let counters = Arc::new(RedisCounters::new(redis.clone(), &prefixes));
    let cancel = CancellationToken::new();

    let queue_config = QueueConfig {
        stream: "relay_test:work".to_string(),
        ack_wait: Duration::from_secs(2),
        read_block: Duration::from_millis(200),
        claim_interval: Duration::from_millis(200),
        ..QueueConfig::default()
    };

    let mut tasks = Vec::new();

    // Two listener processes
    for name in ["listener-a", "listener-b"] {
        let queue = Arc::new(RedisStreamQueue::new(
            redis.clone(),
            queue_config.clone(),
            ConsumerId::new(name),
        ));
        let gate = DedupGate::new(keyspace.clone(), prefixes.dedup.clone(), Duration::from_secs(5));
        let forwarder = Arc::new(ExpirationForwarder::new(gate, queue));
        let listener =
            ExpirationListener::new(keyspace.clone(), EXPIRED_CHANNEL, Duration::from_secs(1));
        tasks.push(listener.spawn(forwarder, cancel.clone()));
    }

    // Two worker processes
    for name in ["worker-a", "worker-b"] {
        let consumer = ConsumerId::new(name);
        let queue = RedisStreamQueue::new(redis.clone(), queue_config.clone(), consumer.clone());
        let handler: Arc<WorkHandler> =
            Arc::new(CountingHandler::new(counters.clone(), consumer));
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            queue.run(handler, cancel).await.unwrap();
        }));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let generator = KeyGenerator::new(keyspace.clone(), counters.clone(), prefixes.gen_key.clone());
    let params = GeneratorConfig {
        num_keys: 20,
        key_delay: Duration::from_millis(5),
        key_ttl: Duration::from_millis(200),
        op_timeout: Duration::from_secs(2),
    };
    let report = generator
        .run(&GenerationRun::new(), &params, &cancel)
        .await
        .unwrap();
    assert_eq!(report.written, 20);

    let probe = counters.clone();
    let all_consumed = wait_until(Duration::from_secs(15), || {
        let probe = probe.clone();
        async move { probe.snapshot().await.map(|s| s.consumed == 20).unwrap_or(false) }
    })
    .await;
    assert!(all_consumed, "not every expiration was consumed");

    // Nothing consumed twice
    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = counters.snapshot().await.unwrap();
    assert_eq!(snapshot.consumed, 20);
    assert_eq!(snapshot.per_worker_total(), 20);
    assert_eq!(redis.xlen("relay_test:work").await.unwrap(), 0);

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    counters.reset().await.unwrap();
}
