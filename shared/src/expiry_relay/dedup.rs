// ============================================================================
// Dedup Gate
// ============================================================================
//
// Collapses the fan-out of keyspace notifications to one forward per key per
// window. Every listener receives the same expiration; each one races to
// create `dedup:<key>` with SET NX PX, and only the creator forwards.
//
// The marker key is itself TTL-bearing, so its own expiration shows up on the
// feed. Callers must drop keys carrying the prefix before claiming, or the
// markers would be forwarded (and re-marked) forever. `try_claim` rejects
// them outright as a second line.
//
// Window semantics:
// - Two claims for the same key less than `window` apart: exactly one wins
// - A claim after the marker expired wins again (a second forward)
//
// ============================================================================

use async_trait::async_trait;
use relay_config::Config;
use relay_error::{RelayError, RelayResult};
use relay_metrics::DEDUP_CLAIMS;
use std::sync::Arc;
use std::time::Duration;

/// Atomic conditional write against the shared store
#[async_trait]
pub trait ClaimStore: Send + Sync + 'static {
    /// Create `key` with expiry `ttl` only if absent; `true` if this call created it
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> RelayResult<bool>;
}

#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn ClaimStore>,
    prefix: String,
    window: Duration,
}

impl DedupGate {
    pub fn new(store: Arc<dyn ClaimStore>, prefix: impl Into<String>, window: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            window,
        }
    }

    pub fn from_config(store: Arc<dyn ClaimStore>, config: &Config) -> Self {
        Self::new(
            store,
            config.redis_key_prefixes.dedup.clone(),
            config.dedup.window,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `dedup:<key>`
    pub fn marker_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// True when `key` is one of the gate's own markers
    pub fn is_marker(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Claim `key` for the configured window
    pub async fn try_claim(&self, key: &str) -> RelayResult<bool> {
        self.try_claim_for(key, self.window).await
    }

    /// Claim `key` for an explicit window
    ///
    /// `Ok(true)`: this caller won and must forward. `Ok(false)`: someone else
    /// holds the claim. `Err`: the store could not be reached; nothing was
    /// claimed and the caller drops the event.
    pub async fn try_claim_for(&self, key: &str, ttl: Duration) -> RelayResult<bool> {
        if self.is_marker(key) {
            return Err(RelayError::Validation(format!(
                "refusing to claim marker key '{}'",
                key
            )));
        }
        if ttl.is_zero() {
            return Err(RelayError::Validation(
                "dedup window must be greater than zero".to_string(),
            ));
        }

        match self.store.set_if_absent(&self.marker_key(key), ttl).await {
            Ok(true) => {
                DEDUP_CLAIMS.with_label_values(&["won"]).inc();
                Ok(true)
            }
            Ok(false) => {
                DEDUP_CLAIMS.with_label_values(&["lost"]).inc();
                Ok(false)
            }
            Err(e) => {
                DEDUP_CLAIMS.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }
}
