// ============================================================================
// Publish Circuit Breaker
// ============================================================================
//
// Wraps broker writes so a dead or slow broker costs the forwarder a fast
// error instead of a pile of tasks stuck on network timeouts.
//
// States:
// - CLOSED: writes go through; consecutive failures are counted
// - OPEN: `failure_threshold` failures in a row, writes rejected immediately
// - HALF_OPEN: `reset_timeout` after the last failure, one trial write at a
//   time is let through (the rest are still rejected); two successful trials
//   close the breaker, one failure reopens it
//
// A rejected or timed-out write is a publish failure like any other: the
// forwarder logs it and the event is lost for its dedup window. Nothing here
// retries.
//
// ============================================================================

use relay_error::{RelayError, RelayResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Successes needed in half-open state before the breaker closes
const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 2;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Upper bound for a single guarded write
    pub timeout: Duration,
    /// Time after the last failure before writes are tried again
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(3),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: u32,
    half_open_successes: u32,
    open: bool,
    trial_in_flight: bool,
    last_failure: Option<Instant>,
}

/// Releases the half-open trial slot, also when the write is dropped midway
struct TrialSlot<'a>(&'a CircuitBreaker);

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        self.0.counters().trial_in_flight = false;
    }
}

enum Admission {
    Closed,
    Trial,
    /// Time since the last failure
    Rejected(Duration),
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `write` under the breaker
    ///
    /// Errors: `CircuitOpen` without running `write` while open, `Timeout` when
    /// the write exceeds the per-call bound, otherwise the write's own error.
    pub async fn call<F, T>(&self, write: F) -> RelayResult<T>
    where
        F: Future<Output = RelayResult<T>>,
    {
        let _trial = match self.admission() {
            Admission::Closed => None,
            Admission::Trial => Some(TrialSlot(self)),
            Admission::Rejected(since_failure) => {
                tracing::warn!(
                    breaker = self.name,
                    since_failure_ms = since_failure.as_millis() as u64,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker OPEN - rejecting write"
                );
                return Err(RelayError::CircuitOpen(since_failure));
            }
        };

        match tokio::time::timeout(self.config.timeout, write).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(e)
            }
            Err(_) => {
                self.record_failure();
                tracing::warn!(
                    breaker = self.name,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Guarded write timed out"
                );
                Err(RelayError::Timeout(self.config.timeout))
            }
        }
    }

    fn admission(&self) -> Admission {
        let mut counters = self.counters();
        if !counters.open {
            return Admission::Closed;
        }
        let since_failure = counters
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or_default();
        if since_failure < self.config.reset_timeout || counters.trial_in_flight {
            return Admission::Rejected(since_failure);
        }

        counters.trial_in_flight = true;
        tracing::info!(
            breaker = self.name,
            "Circuit breaker half-open - letting a trial write through"
        );
        Admission::Trial
    }

    fn record_success(&self) {
        let mut counters = self.counters();
        if counters.open {
            counters.half_open_successes += 1;
            if counters.half_open_successes >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                *counters = Counters::default();
                tracing::info!(breaker = self.name, "Circuit breaker CLOSED - broker recovered");
            }
        } else {
            counters.consecutive_failures = 0;
        }
    }

    fn record_failure(&self) {
        let mut counters = self.counters();
        counters.consecutive_failures += 1;
        counters.half_open_successes = 0;
        counters.last_failure = Some(Instant::now());

        if counters.consecutive_failures >= self.config.failure_threshold && !counters.open {
            counters.open = true;
            tracing::error!(
                breaker = self.name,
                failures = counters.consecutive_failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker OPENED - too many consecutive failures"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        let counters = self.counters();
        match (counters.open, counters.last_failure) {
            (false, _) => BreakerState::Closed,
            (true, Some(at)) if at.elapsed() >= self.config.reset_timeout => {
                BreakerState::HalfOpen
            }
            (true, _) => BreakerState::Open,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.counters().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout: Duration::from_millis(100),
                reset_timeout: Duration::from_secs(1),
            },
        )
    }

    fn broker_down() -> RelayError {
        RelayError::Kafka("broker down".to_string())
    }

    #[tokio::test]
    async fn test_success_keeps_breaker_closed() {
        let cb = breaker(3);
        let value = cb.call(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3);
        for _ in 0..3 {
            assert!(cb.call(async { Err::<(), _>(broker_down()) }).await.is_err());
        }
        assert_eq!(cb.state(), BreakerState::Open);

        let executed = Arc::new(AtomicU32::new(0));
        let probe = executed.clone();
        let result = cb
            .call(async move {
                probe.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(RelayError::CircuitOpen(_))));
        assert_eq!(executed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out() {
        let cb = breaker(5);
        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(RelayError::Timeout(_))));
        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_needs_two_successes() {
        let cb = breaker(2);
        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>(broker_down()) }).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2);
        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>(broker_down()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(cb.call(async { Err::<(), _>(broker_down()) }).await.is_err());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let cb = breaker(2);
        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>(broker_down()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let slow_trial = cb.call(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let concurrent = cb.call(async { Ok(()) });
        let (trial, rejected) = tokio::join!(slow_trial, concurrent);

        assert!(trial.is_ok());
        assert!(matches!(rejected, Err(RelayError::CircuitOpen(_))));

        // Slot is free again once the trial finished
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let cb = breaker(2);
        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>(broker_down()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        assert!(cb.call(async { Ok(()) }).await.is_ok());
    }
}
