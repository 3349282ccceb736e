// ============================================================================
// In-Memory Work Queue
// ============================================================================
//
// Process-local broker with the same delivery contract as the networked
// backends: competing members, leases that expire after `ack_wait`, at most
// `max_deliver` deliveries per item, oldest item first. Items older than
// `max_age` are dropped whether or not they are leased.
//
// Every member shares one `MemoryBroker`; `member()` hands out group
// memberships, the broker itself is the publisher.
//
// ============================================================================

use super::{ConsumerGroup, WorkHandler, WorkPublisher};
use crate::events::{ConsumerId, Delivery, HandleOutcome, WorkItem};
use async_trait::async_trait;
use relay_config::QueueConfig;
use relay_error::RelayResult;
use relay_metrics::{
    ACKS, DELIVERIES, DELIVERIES_EXHAUSTED, EVENTS_PUBLISHED, ITEMS_EXPIRED, REDELIVERIES,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters describing what the broker has seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub deliveries: u64,
    pub acked: u64,
    pub exhausted: u64,
    /// Dropped by the retention ceiling
    pub expired: u64,
    /// Items still waiting for delivery or acknowledgment
    pub outstanding: usize,
}

struct Lease {
    consumer: ConsumerId,
    deadline: Instant,
}

struct QueuedItem {
    item: WorkItem,
    published_at: Instant,
    deliveries: u32,
    lease: Option<Lease>,
}

#[derive(Default)]
struct BrokerState {
    next_seq: u64,
    items: BTreeMap<u64, QueuedItem>,
    stats: BrokerStats,
}

struct BrokerInner {
    config: QueueConfig,
    state: Mutex<BrokerState>,
    published: Notify,
}

/// What a member found when asking for work
enum Poll {
    Deliver(Delivery),
    /// Nothing deliverable; the earliest lease deadline, if any
    Idle(Option<Instant>),
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                state: Mutex::new(BrokerState::default()),
                published: Notify::new(),
            }),
        }
    }

    /// A membership in the group under the given identity
    pub fn member(&self, consumer: ConsumerId) -> MemoryMember {
        MemoryMember {
            broker: self.clone(),
            consumer,
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            outstanding: state.items.len(),
            ..state.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lease the oldest deliverable item to `consumer`
    ///
    /// Items past `max_age`, and items whose lease expired after their last
    /// allowed delivery, are retired on the way.
    fn poll(&self, consumer: &ConsumerId) -> Poll {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut state = self.lock();
        let mut retired = Vec::new();
        let mut aged = Vec::new();
        let mut next_deadline: Option<Instant> = None;
        let mut leased = None;

        for (seq, queued) in state.items.iter_mut() {
            if now.duration_since(queued.published_at) >= config.max_age {
                aged.push(*seq);
                continue;
            }

            match &queued.lease {
                Some(lease) if lease.deadline > now => {
                    next_deadline = Some(match next_deadline {
                        Some(at) => at.min(lease.deadline),
                        None => lease.deadline,
                    });
                    continue;
                }
                _ => {}
            }

            if queued.deliveries >= config.max_deliver {
                retired.push(*seq);
                continue;
            }

            queued.deliveries += 1;
            queued.lease = Some(Lease {
                consumer: consumer.clone(),
                deadline: now + config.ack_wait,
            });
            leased = Some(Delivery {
                item: queued.item.clone(),
                attempt: queued.deliveries,
                message_id: seq.to_string(),
            });
            break;
        }

        for seq in aged {
            if let Some(queued) = state.items.remove(&seq) {
                state.stats.expired += 1;
                ITEMS_EXPIRED.inc();
                warn!(
                    key = %queued.item.key,
                    message_id = seq,
                    deliveries = queued.deliveries,
                    "Work item exceeded the retention age, dropping"
                );
            }
        }

        for seq in retired {
            if let Some(queued) = state.items.remove(&seq) {
                state.stats.exhausted += 1;
                DELIVERIES_EXHAUSTED.inc();
                warn!(
                    key = %queued.item.key,
                    message_id = seq,
                    deliveries = queued.deliveries,
                    "Work item exhausted its deliveries, dropping"
                );
            }
        }

        match leased {
            Some(delivery) => {
                state.stats.deliveries += 1;
                Poll::Deliver(delivery)
            }
            None => Poll::Idle(next_deadline),
        }
    }

    /// Acknowledge a delivery; a no-op if the item is already gone
    fn ack(&self, message_id: &str) -> bool {
        let Ok(seq) = message_id.parse::<u64>() else {
            return false;
        };
        let mut state = self.lock();
        if state.items.remove(&seq).is_some() {
            state.stats.acked += 1;
            true
        } else {
            false
        }
    }

    /// Who currently holds the lease on a message, if anyone
    pub fn lease_holder(&self, message_id: &str) -> Option<ConsumerId> {
        let seq = message_id.parse::<u64>().ok()?;
        let state = self.lock();
        state
            .items
            .get(&seq)
            .and_then(|q| q.lease.as_ref())
            .filter(|lease| lease.deadline > Instant::now())
            .map(|lease| lease.consumer.clone())
    }
}

#[async_trait]
impl WorkPublisher for MemoryBroker {
    async fn ensure_stream(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn publish(&self, key: &str) -> RelayResult<String> {
        let seq = {
            let mut state = self.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.items.insert(
                seq,
                QueuedItem {
                    item: WorkItem::new(key),
                    published_at: Instant::now(),
                    deliveries: 0,
                    lease: None,
                },
            );
            state.stats.published += 1;
            seq
        };
        EVENTS_PUBLISHED.inc();
        self.inner.published.notify_waiters();
        Ok(seq.to_string())
    }
}

pub struct MemoryMember {
    broker: MemoryBroker,
    consumer: ConsumerId,
}

impl MemoryMember {
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer
    }

    fn dispatch(&self, handler: &Arc<WorkHandler>, delivery: Delivery) {
        DELIVERIES.inc();
        if delivery.is_redelivery() {
            REDELIVERIES.inc();
        }
        debug!(
            key = %delivery.item.key,
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            consumer = %self.consumer,
            "Dispatching work item"
        );

        let handler = Arc::clone(handler);
        let broker = self.broker.clone();
        tokio::spawn(async move {
            let message_id = delivery.message_id.clone();
            if handler.handle(delivery).await == HandleOutcome::Ack && broker.ack(&message_id) {
                ACKS.inc();
            }
        });
    }
}

#[async_trait]
impl ConsumerGroup for MemoryMember {
    async fn run(&self, handler: Arc<WorkHandler>, cancel: CancellationToken) -> RelayResult<()> {
        let config = &self.broker.inner.config;
        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %self.consumer,
            "Joined in-memory consumer group"
        );

        while !cancel.is_cancelled() {
            // Registered before polling so a publish in between is not missed
            let published = self.broker.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            match self.broker.poll(&self.consumer) {
                Poll::Deliver(delivery) => self.dispatch(&handler, delivery),
                Poll::Idle(next_deadline) => {
                    let wake_at =
                        next_deadline.unwrap_or_else(|| Instant::now() + config.claim_interval);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = &mut published => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
            }
        }

        info!(consumer = %self.consumer, "Left in-memory consumer group");
        Ok(())
    }
}
