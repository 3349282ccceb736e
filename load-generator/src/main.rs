// ============================================================================
// Load Generator
// ============================================================================
//
// Drives one generation run against the shared Redis: resets the pipeline
// counters, then writes GEN_NUM_KEYS short-lived `gen-key:<seq>` records so
// their expirations flow through every running relay-worker.
//
// Ctrl-C stops the run before its next key. The final counter snapshot is
// logged on exit; `consumed` keeps climbing for a while after the last write
// as the remaining keys expire.
//
// ============================================================================

use anyhow::{Context, Result};
use relay_config::Config;
use relay_redis::RedisClient;
use relay_shared::{
    GenerationRun, KeyGenerator, PipelineCounters, RedisCounters, RedisKeyspace, init_tracing,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("=== Load Generator Starting ===");
    info!("Connecting to Redis at: {}", config.redis_url_for_logging());

    let mut redis = RedisClient::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    redis.ping().await.context("Redis did not answer PING")?;

    let keyspace = Arc::new(RedisKeyspace::new(redis.clone()));
    if let Err(e) = keyspace.enable_expired_events().await {
        warn!(error = %e, "Could not enable keyspace notifications");
    }
    let counters = Arc::new(RedisCounters::new(redis, &config.redis_key_prefixes));
    let generator = KeyGenerator::new(
        keyspace,
        counters.clone(),
        config.redis_key_prefixes.gen_key.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping generation...");
                cancel.cancel();
            }
        }
    });

    let run = GenerationRun::new();
    let report = generator
        .run(&run, &config.generator, &cancel)
        .await
        .context("Generation run failed")?;

    info!(
        written = report.written,
        failed = report.failed,
        interrupted = report.interrupted,
        "Generation run complete"
    );

    match counters.snapshot().await {
        Ok(snapshot) => {
            info!(
                generated = snapshot.generated,
                consumed = snapshot.consumed,
                "Pipeline counters"
            );
            for (worker, count) in &snapshot.per_worker {
                info!(worker = %worker, consumed = count, "Per-worker counter");
            }
        }
        Err(e) => warn!(error = %e, "Failed to read pipeline counters"),
    }

    Ok(())
}
