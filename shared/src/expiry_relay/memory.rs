// ============================================================================
// In-Memory Keyspace
// ============================================================================
//
// A process-local stand-in for the Redis keyspace: TTL-bearing records, the
// conditional claim write, and a fan-out expiration feed. Used by tests and
// single-process runs; every subscriber sees every expiration, exactly like
// keyspace notifications.
//
// Expiry is driven by tokio timers, so tests running with a paused clock
// control it deterministically. Reads also treat a passed deadline as absent,
// the way Redis expires lazily on access.
//
// Fault injection:
// - `drop_subscriptions()` ends every live feed (connection killed)
// - `set_available(false)` fails subscribes and writes (server unreachable)
//
// ============================================================================

use crate::dedup::ClaimStore;
use crate::generator::TtlStore;
use crate::listener::{ExpirationSource, NotificationStream};
use async_trait::async_trait;
use relay_error::{RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

const DEFAULT_EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

struct Record {
    value: String,
    deadline: Instant,
    version: u64,
}

#[derive(Default)]
struct KeyspaceState {
    records: HashMap<String, Record>,
    next_version: u64,
    subscribers: Vec<(String, mpsc::UnboundedSender<RelayResult<String>>)>,
    unavailable: bool,
}

#[derive(Clone)]
pub struct MemoryKeyspace {
    state: Arc<Mutex<KeyspaceState>>,
    expired_channel: String,
}

impl Default for MemoryKeyspace {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRED_CHANNEL)
    }
}

impl MemoryKeyspace {
    pub fn new(expired_channel: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(KeyspaceState::default())),
            expired_channel: expired_channel.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyspaceState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(state: &KeyspaceState) -> RelayResult<()> {
        if state.unavailable {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "keyspace unavailable",
            )));
        }
        Ok(())
    }

    /// Insert or overwrite `key` and arm its expiry timer
    fn insert(&self, state: &mut KeyspaceState, key: &str, value: String, ttl: Duration) {
        state.next_version += 1;
        let version = state.next_version;
        state.records.insert(
            key.to_string(),
            Record {
                value,
                deadline: Instant::now() + ttl,
                version,
            },
        );

        let keyspace = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            keyspace.expire(&key, version);
        });
    }

    /// Remove `key` if it is still the same write, then notify subscribers
    fn expire(&self, key: &str, version: u64) {
        let mut state = self.lock();
        let current = state.records.get(key).map(|r| r.version);
        if current != Some(version) {
            return;
        }
        state.records.remove(key);
        self.broadcast(&mut state, key);
    }

    fn broadcast(&self, state: &mut KeyspaceState, key: &str) {
        let channel = &self.expired_channel;
        state.subscribers.retain(|(subscribed, tx)| {
            subscribed != channel || tx.send(Ok(key.to_string())).is_ok()
        });
    }

    /// Publish an expiration without touching the records
    pub fn notify_expired(&self, key: &str) {
        let mut state = self.lock();
        self.broadcast(&mut state, key);
    }

    pub fn contains(&self, key: &str) -> bool {
        let state = self.lock();
        state
            .records
            .get(key)
            .is_some_and(|r| r.deadline > Instant::now())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.lock();
        state
            .records
            .get(key)
            .filter(|r| r.deadline > Instant::now())
            .map(|r| r.value.clone())
    }

    /// Live feeds, counting only those whose receiver is still held
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        let channel = &self.expired_channel;
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(subscribed, _)| subscribed == channel)
            .count()
    }

    /// End every live feed, as if the server closed the connections
    pub fn drop_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    /// Simulate the server becoming unreachable (or reachable again)
    ///
    /// Going unavailable also drops every live feed.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.unavailable = !available;
        if !available {
            state.subscribers.clear();
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryKeyspace {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> RelayResult<bool> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let live = state
            .records
            .get(key)
            .is_some_and(|r| r.deadline > Instant::now());
        if live {
            return Ok(false);
        }
        self.insert(&mut state, key, "1".to_string(), ttl);
        Ok(true)
    }
}

#[async_trait]
impl TtlStore for MemoryKeyspace {
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        self.insert(&mut state, key, value.to_string(), ttl);
        Ok(())
    }
}

#[async_trait]
impl ExpirationSource for MemoryKeyspace {
    async fn subscribe(&self, channel: &str) -> RelayResult<NotificationStream> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((channel.to_string(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
