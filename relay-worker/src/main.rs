// ============================================================================
// Relay Worker - Expired key relay
// ============================================================================
//
// One process of the expiry relay. Depending on RELAY_ROLES it runs:
//
// - forwarder: subscribes to the keyspace `expired` channel, claims each
//   expired key through the dedup gate and publishes the winners to the work
//   queue
// - consumer: joins the work queue's consumer group and counts every item it
//   handles (per worker and in total)
//
// Any number of these processes can run side by side. The dedup gate keeps
// the fan-out of keyspace notifications from turning into duplicate work
// items, and the consumer group hands each item to one worker at a time.
//
// Startup failures (Redis unreachable, stream cannot be created) are fatal.
// Everything after startup is retried or logged; SIGTERM/Ctrl-C cancels all
// tasks and the process exits once they have stopped.
//
// ============================================================================

use anyhow::{Context, Result};
use relay_config::Config;
use relay_redis::RedisClient;
use relay_shared::{
    ConsumerId, CountingHandler, DedupGate, ExpirationForwarder, ExpirationListener,
    PipelineCounters, RedisCounters, RedisKeyspace, WorkHandler, WorkQueue, init_tracing,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often the counter summary is logged
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let consumer_id = ConsumerId::new(config.consumer_id.clone());
    info!("=== Relay Worker Starting ===");
    info!(
        consumer_id = %consumer_id,
        forwarder = config.roles.forwarder,
        consumer = config.roles.consumer,
        backend = %config.queue.backend,
        "Configured roles"
    );
    info!("Connecting to Redis at: {}", config.redis_url_for_logging());

    let mut redis = RedisClient::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    redis.ping().await.context("Redis did not answer PING")?;
    info!("Connected to Redis");

    let queue = WorkQueue::connect(&config, &redis, &consumer_id)
        .await
        .context("Failed to configure work queue")?;
    queue
        .publisher
        .ensure_stream()
        .await
        .context("Failed to create work stream")?;

    let counters: Arc<dyn PipelineCounters> =
        Arc::new(RedisCounters::new(redis.clone(), &config.redis_key_prefixes));

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.roles.consumer {
        let handler: Arc<WorkHandler> =
            Arc::new(CountingHandler::new(counters.clone(), consumer_id.clone()));
        let consumer = queue.consumer.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = consumer.run(handler, cancel.clone()).await {
                error!(error = %e, "Consumer group failed, shutting down");
                cancel.cancel();
            }
        }));
        info!("Started consumer");
    }

    if config.roles.forwarder {
        let keyspace = Arc::new(RedisKeyspace::new(redis.clone()));
        if let Err(e) = keyspace.enable_expired_events().await {
            warn!(error = %e, "Could not enable keyspace notifications");
        }

        let gate = DedupGate::from_config(keyspace.clone(), &config);
        let forwarder = Arc::new(ExpirationForwarder::new(gate, queue.publisher.clone()));
        let listener = ExpirationListener::new(
            keyspace,
            config.redis_channels.expired.clone(),
            config.listener.reconnect_backoff,
        );
        tasks.push(listener.spawn(forwarder, cancel.clone()));
        info!(channel = %config.redis_channels.expired, "Started expiration listener");
    }

    tasks.push(tokio::spawn(log_summary(counters, cancel.clone())));

    wait_for_shutdown_signal(&cancel).await;
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task panicked during shutdown");
        }
    }

    info!("=== Relay Worker Stopped ===");
    Ok(())
}

/// Periodic counter summary plus the process-local Prometheus text at debug
async fn log_summary(counters: Arc<dyn PipelineCounters>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match counters.snapshot().await {
            Ok(snapshot) => info!(
                generated = snapshot.generated,
                consumed = snapshot.consumed,
                workers = snapshot.per_worker.len(),
                "Pipeline summary"
            ),
            Err(e) => warn!(error = %e, "Failed to read pipeline counters"),
        }

        match relay_metrics::gather_metrics() {
            Ok(text) => tracing::debug!(metrics = %text, "Process metrics"),
            Err(e) => warn!(error = %e, "Failed to gather metrics"),
        }
    }
}

/// Resolves on SIGTERM or Ctrl-C, or when something else cancels the token
async fn wait_for_shutdown_signal(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown..."),
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown..."),
                    _ = cancel.cancelled() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, initiating graceful shutdown..."),
        _ = cancel.cancelled() => {}
    }
}
