// ============================================================================
// Load Generator
// ============================================================================
//
// Writes `gen-key:<seq>` records with a short TTL so their expirations drive
// the relay end to end. Each run:
//
// 1. moves the run state Idle -> Running (a second start is rejected)
// 2. resets the shared counters
// 3. writes `num_keys` records, `key_delay` apart, bumping `metrics:generated`
//    after each successful write
// 4. returns to Idle when done, when stopped, or when cancelled
//
// A failed write is logged and skipped; the run carries on with the next key.
//
// ============================================================================

use crate::counters::PipelineCounters;
use async_trait::async_trait;
use relay_config::GeneratorConfig;
use relay_error::{RelayError, RelayResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Progress is logged every this many keys
const PROGRESS_LOG_INTERVAL: u64 = 100;

/// Plain TTL-bearing write against the shared store
#[async_trait]
pub trait TtlStore: Send + Sync + 'static {
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Idle/Running state of the load generator, shared with whoever stops it
///
/// Every start hands out a new generation number. A run only keeps going,
/// and only returns the state to Idle, while its generation is the current
/// one, so a stopped run that has not noticed yet cannot end its successor.
#[derive(Debug)]
pub struct GenerationRun {
    state: Mutex<RunSlot>,
}

#[derive(Debug)]
struct RunSlot {
    state: RunState,
    generation: u64,
}

impl Default for GenerationRun {
    fn default() -> Self {
        Self {
            state: Mutex::new(RunSlot {
                state: RunState::Idle,
                generation: 0,
            }),
        }
    }
}

impl GenerationRun {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunSlot> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Idle -> Running; the new generation, or `None` if a run is in progress
    pub fn try_start(&self) -> Option<u64> {
        let mut slot = self.lock();
        if slot.state == RunState::Running {
            return None;
        }
        slot.state = RunState::Running;
        slot.generation += 1;
        Some(slot.generation)
    }

    /// Running -> Idle; the active run stops before its next key
    pub fn stop(&self) {
        self.lock().state = RunState::Idle;
    }

    /// Running -> Idle, only if `generation` is still the active run
    fn finish(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.state = RunState::Idle;
        }
    }

    fn owns(&self, generation: u64) -> bool {
        let slot = self.lock();
        slot.state == RunState::Running && slot.generation == generation
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == RunState::Running
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }
}

/// Summary of one generation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub written: u64,
    pub failed: u64,
    /// Ended by `stop()` or cancellation before writing every key
    pub interrupted: bool,
}

pub struct KeyGenerator {
    store: Arc<dyn TtlStore>,
    counters: Arc<dyn PipelineCounters>,
    prefix: String,
}

impl KeyGenerator {
    pub fn new(
        store: Arc<dyn TtlStore>,
        counters: Arc<dyn PipelineCounters>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            counters,
            prefix: prefix.into(),
        }
    }

    pub fn key_for(&self, seq: u64) -> String {
        format!("{}{}", self.prefix, seq)
    }

    /// `SET gen-key:<seq> <seq> PX <ttl>`, then count it as generated
    pub async fn generate_key(&self, seq: u64, ttl: Duration) -> RelayResult<String> {
        let key = self.key_for(seq);
        self.store
            .put_with_ttl(&key, &seq.to_string(), ttl)
            .await?;
        self.counters.incr_generated().await?;
        Ok(key)
    }

    /// One full run; see the module header for the sequence
    pub async fn run(
        &self,
        run: &GenerationRun,
        params: &GeneratorConfig,
        cancel: &CancellationToken,
    ) -> RelayResult<GenerationReport> {
        let Some(generation) = run.try_start() else {
            return Err(RelayError::Validation(
                "a generation run is already in progress".to_string(),
            ));
        };

        let result = self.write_keys(run, generation, params, cancel).await;
        run.finish(generation);
        result
    }

    async fn write_keys(
        &self,
        run: &GenerationRun,
        generation: u64,
        params: &GeneratorConfig,
        cancel: &CancellationToken,
    ) -> RelayResult<GenerationReport> {
        self.counters.reset().await?;
        info!(
            num_keys = params.num_keys,
            key_delay_ms = params.key_delay.as_millis() as u64,
            key_ttl_ms = params.key_ttl.as_millis() as u64,
            "Starting key generation"
        );

        let mut report = GenerationReport::default();
        for seq in 0..params.num_keys {
            if !run.owns(generation) || cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match tokio::time::timeout(params.op_timeout, self.generate_key(seq, params.key_ttl))
                .await
            {
                Ok(Ok(_)) => report.written += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(error = %e, seq = seq, "Failed to write generated key, skipping");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        seq = seq,
                        timeout_ms = params.op_timeout.as_millis() as u64,
                        "Timed out writing generated key, skipping"
                    );
                }
            }

            if seq > 0 && seq % PROGRESS_LOG_INTERVAL == 0 {
                info!(generated = seq, total = params.num_keys, "Key generation progress");
            }

            if !params.key_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(params.key_delay) => {}
                }
            }
        }

        info!(
            written = report.written,
            failed = report.failed,
            interrupted = report.interrupted,
            "Key generation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MemoryCounters;
    use crate::memory::MemoryKeyspace;

    fn params(num_keys: u64) -> GeneratorConfig {
        GeneratorConfig {
            num_keys,
            key_delay: Duration::from_millis(10),
            key_ttl: Duration::from_secs(1),
            op_timeout: Duration::from_secs(2),
        }
    }

    fn generator() -> (KeyGenerator, Arc<MemoryKeyspace>, Arc<MemoryCounters>) {
        let keyspace = Arc::new(MemoryKeyspace::default());
        let counters = Arc::new(MemoryCounters::new());
        let generator = KeyGenerator::new(keyspace.clone(), counters.clone(), "gen-key:");
        (generator, keyspace, counters)
    }

    #[test]
    fn test_run_state_machine() {
        let run = GenerationRun::new();
        assert_eq!(run.state(), RunState::Idle);
        assert_eq!(run.try_start(), Some(1));
        assert_eq!(run.try_start(), None);
        assert!(run.is_running());
        run.stop();
        assert_eq!(run.state(), RunState::Idle);
        assert_eq!(run.try_start(), Some(2));
    }

    #[test]
    fn test_stale_run_cannot_end_its_successor() {
        let run = GenerationRun::new();
        let first = run.try_start().unwrap();
        run.stop();
        let second = run.try_start().unwrap();

        assert!(!run.owns(first));
        run.finish(first);
        assert!(run.is_running());
        assert!(run.owns(second));

        run.finish(second);
        assert_eq!(run.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_while_stopped_run_is_sleeping() {
        let (generator, _, _) = generator();
        let generator = Arc::new(generator);
        let run = Arc::new(GenerationRun::new());

        let first = tokio::spawn({
            let generator = generator.clone();
            let run = run.clone();
            async move {
                generator
                    .run(&run, &params(1000), &CancellationToken::new())
                    .await
            }
        });

        // Stop and restart before the first run wakes from its key delay
        tokio::time::sleep(Duration::from_millis(55)).await;
        run.stop();
        let second = tokio::spawn({
            let generator = generator.clone();
            let run = run.clone();
            async move {
                generator
                    .run(&run, &params(1000), &CancellationToken::new())
                    .await
            }
        });
        tokio::task::yield_now().await;

        let first = first.await.unwrap().unwrap();
        assert!(first.interrupted);
        // The first run's exit left the second one running
        assert!(run.is_running());

        run.stop();
        let second = second.await.unwrap().unwrap();
        assert!(second.interrupted);
        assert_eq!(run.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_key_writes_record_and_counts() {
        let (generator, keyspace, counters) = generator();

        let key = generator.generate_key(7, Duration::from_secs(1)).await.unwrap();

        assert_eq!(key, "gen-key:7");
        assert_eq!(keyspace.get("gen-key:7").as_deref(), Some("7"));
        assert_eq!(counters.snapshot().await.unwrap().generated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_resets_then_writes_every_key() {
        let (generator, _, counters) = generator();
        counters.incr_generated().await.unwrap();
        counters.incr_consumed_by("stale").await.unwrap();

        let run = GenerationRun::new();
        let report = generator
            .run(&run, &params(25), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.written, 25);
        assert!(!report.interrupted);
        assert!(!run.is_running());

        let snapshot = counters.snapshot().await.unwrap();
        assert_eq!(snapshot.generated, 25);
        assert!(snapshot.per_worker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let (generator, _, _) = generator();
        let run = GenerationRun::new();
        assert!(run.try_start().is_some());

        let err = generator
            .run(&run, &params(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        // The rejected call must not end the active run
        assert!(run.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_run_early() {
        let (generator, _, counters) = generator();
        let generator = Arc::new(generator);
        let run = Arc::new(GenerationRun::new());

        let task = tokio::spawn({
            let generator = generator.clone();
            let run = run.clone();
            async move {
                generator
                    .run(&run, &params(1000), &CancellationToken::new())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        run.stop();
        let report = task.await.unwrap().unwrap();

        assert!(report.interrupted);
        assert!(report.written < 1000);
        assert_eq!(counters.snapshot().await.unwrap().generated, report.written as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_are_skipped() {
        let (generator, keyspace, _) = generator();
        keyspace.set_available(false);

        let run = GenerationRun::new();
        let report = generator
            .run(&run, &params(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.written, 0);
        assert_eq!(report.failed, 3);
        assert!(!report.interrupted);
    }
}
