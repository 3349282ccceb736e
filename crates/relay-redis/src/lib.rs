//! # Relay Redis
//!
//! Low-level Redis client for the expiry relay.
//!
//! ## Design Principles
//!
//! - **No business logic** - key names and prefixes come from callers
//! - **No dependencies** on other relay-* crates
//! - **Cheap to clone** - one multiplexed connection shared by all tasks
//!
//! ## Features
//!
//! - Connection management with automatic reconnection
//! - Conditional writes (`SET NX PX`) with millisecond TTLs
//! - Atomic counters and pipelines
//! - Pub/Sub on a dedicated connection
//! - Redis Streams with consumer groups
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_redis::RedisClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = RedisClient::connect("redis://localhost:6379").await?;
//!
//!     let claimed = client.set_nx_px("dedup:gen-key:1", 1, Duration::from_secs(5)).await?;
//!     assert!(claimed);
//!
//!     Ok(())
//! }
//! ```

mod client;
mod pubsub;
mod streams;

pub use client::RedisClient;
pub use streams::{PendingEntry, StreamEntry, StreamReadOptions};

// Re-export commonly used types
pub use redis::RedisError;

/// Result type for Redis operations
pub type Result<T> = std::result::Result<T, RedisError>;
