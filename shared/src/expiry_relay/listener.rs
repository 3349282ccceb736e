// ============================================================================
// Expiration Source Adapter
// ============================================================================
//
// Subscribes to the store's keyspace expiration feed and hands every expired
// key to an injected handler on its own task.
//
// The feed is fan-out: every listening process receives every notification.
// Turning that into a single forward is the dedup gate's job, one layer up;
// this adapter neither filters nor deduplicates.
//
// Failure handling: a failed subscribe, an error item, or the end of the
// stream all mean the subscription is broken. The adapter drops it, waits a
// fixed backoff and subscribes again, until cancelled. Notifications emitted
// during the gap are lost - keyspace notifications are not durable.
//
// ============================================================================

use crate::events::ExpirationEvent;
use crate::handler::EventHandler;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use relay_error::RelayResult;
use relay_metrics::{EXPIRATIONS_RECEIVED, LISTENER_RECONNECTS};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raw expired-key payloads; `Err` or end-of-stream means the subscription broke
pub type NotificationStream = Pin<Box<dyn Stream<Item = RelayResult<String>> + Send>>;

/// A live notification feed that can be (re)subscribed to
#[async_trait]
pub trait ExpirationSource: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> RelayResult<NotificationStream>;
}

/// Why one subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionEnd {
    Cancelled,
    Broken,
}

pub struct ExpirationListener {
    source: Arc<dyn ExpirationSource>,
    channel: String,
    reconnect_backoff: Duration,
}

impl ExpirationListener {
    pub fn new(
        source: Arc<dyn ExpirationSource>,
        channel: impl Into<String>,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            source,
            channel: channel.into(),
            reconnect_backoff,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Run the supervisor loop on a background task
    pub fn spawn<H>(self, handler: Arc<H>, cancel: CancellationToken) -> JoinHandle<()>
    where
        H: EventHandler<ExpirationEvent>,
    {
        tokio::spawn(async move { self.run(handler, cancel).await })
    }

    /// Supervisor loop: subscribe, dispatch, and resubscribe after failures
    ///
    /// Returns once `cancel` fires. In-flight handler tasks are not awaited.
    pub async fn run<H>(&self, handler: Arc<H>, cancel: CancellationToken)
    where
        H: EventHandler<ExpirationEvent>,
    {
        let mut established: u64 = 0;

        while !cancel.is_cancelled() {
            info!(channel = %self.channel, "Subscribing to key expiration events...");

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.subscribe(&self.channel) => result,
            };

            let stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        error = %e,
                        transient = e.is_transient(),
                        channel = %self.channel,
                        backoff_ms = self.reconnect_backoff.as_millis() as u64,
                        "Failed to subscribe to expiration events, will retry"
                    );
                    if !self.wait_backoff(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if established > 0 {
                LISTENER_RECONNECTS.inc();
                info!(channel = %self.channel, "Expiration subscription re-established");
            }
            established += 1;

            match self.consume(stream, &handler, &cancel).await {
                SubscriptionEnd::Cancelled => break,
                SubscriptionEnd::Broken => {
                    warn!(
                        channel = %self.channel,
                        backoff_ms = self.reconnect_backoff.as_millis() as u64,
                        "Expiration subscription broken, will reconnect"
                    );
                    if !self.wait_backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!(channel = %self.channel, "Expiration listener stopped");
    }

    /// Drain one subscription until it breaks or the listener is cancelled
    ///
    /// The stream is dropped (closing the subscription) on return.
    async fn consume<H>(
        &self,
        mut stream: NotificationStream,
        handler: &Arc<H>,
        cancel: &CancellationToken,
    ) -> SubscriptionEnd
    where
        H: EventHandler<ExpirationEvent>,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SubscriptionEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(key)) => {
                    EXPIRATIONS_RECEIVED.inc();
                    debug!(key = %key, "Received expired key");

                    // One task per notification so a slow handler never delays
                    // receipt of the next key
                    let handler = Arc::clone(handler);
                    tokio::spawn(async move {
                        handler.handle(ExpirationEvent::new(key)).await;
                    });
                }
                Some(Err(e)) => {
                    error!(
                        error = %e,
                        transient = e.is_transient(),
                        "Error receiving expiration notification"
                    );
                    return SubscriptionEnd::Broken;
                }
                None => {
                    warn!(channel = %self.channel, "Expiration notification stream ended");
                    return SubscriptionEnd::Broken;
                }
            }
        }
    }

    /// Sleep for the reconnect backoff; `false` if cancelled meanwhile
    async fn wait_backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_backoff) => true,
        }
    }
}
