//! Kafka backend for the work queue
//!
//! The topic plays the stream, the consumer group plays the group. Kafka has
//! no per-message ack or redelivery of its own, so the consumer runs each
//! message against the ack deadline and keeps delivery attempts in Redis;
//! offsets are committed once a message is acknowledged or exhausted.

mod config;
mod consumer;
mod producer;

pub use config::create_client_config;
pub use consumer::KafkaConsumerGroup;
pub use producer::KafkaWorkPublisher;
