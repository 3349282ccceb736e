// ============================================================================
// Expiry Relay - Pipeline Library
// ============================================================================
//
//   keyspace expiration feed (fan-out to every listener)
//        -> ExpirationListener
//        -> ExpirationForwarder (DedupGate: one claim per key per window)
//        -> WorkPublisher (durable work queue)
//        -> ConsumerGroup (competing members, ack deadline, bounded redelivery)
//        -> CountingHandler (shared counters)
//
// KeyGenerator produces the TTL-bearing records that feed the pipeline under
// load.
//
// ============================================================================

pub mod counters;
pub mod dedup;
pub mod events;
pub mod forwarder;
pub mod generator;
pub mod handler;
pub mod kafka;
pub mod keyspace;
pub mod listener;
pub mod logging;
pub mod memory;
pub mod queue;
pub mod worker;

pub use counters::{CounterSnapshot, MemoryCounters, PipelineCounters, RedisCounters};
pub use dedup::{ClaimStore, DedupGate};
pub use events::{
    ConsumerId, Delivery, ExpirationEvent, ForwardOutcome, HandleOutcome, WorkItem,
};
pub use forwarder::ExpirationForwarder;
pub use generator::{GenerationReport, GenerationRun, KeyGenerator, RunState, TtlStore};
pub use handler::EventHandler;
pub use keyspace::RedisKeyspace;
pub use listener::{ExpirationListener, ExpirationSource, NotificationStream};
pub use logging::init_tracing;
pub use memory::MemoryKeyspace;
pub use queue::{ConsumerGroup, MemoryBroker, WorkHandler, WorkPublisher, WorkQueue};
pub use worker::CountingHandler;
