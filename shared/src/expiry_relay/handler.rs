// ============================================================================
// Event Handler Capability
// ============================================================================
//
// The listener and the consumer group both receive their per-message logic as
// a single-method capability instead of a closure over mutable state. Each
// invocation is spawned as its own task, so implementations share only what
// they hold behind an Arc.
//
// ============================================================================

use async_trait::async_trait;

#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static
where
    E: Send + 'static,
{
    type Outcome: Send + 'static;

    async fn handle(&self, event: E) -> Self::Outcome;
}

