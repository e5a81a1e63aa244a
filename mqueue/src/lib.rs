//! In-process message queue for the task orchestration system
//!
//! This crate implements the broker, producer and consumer sides of a small
//! HTTP message queue with durable message records. The broker keeps a
//! registry of consumers per channel, persists every message row before the
//! first delivery attempt, fans messages out over HTTP POST and records
//! acknowledgements. Delivery is at-least-once; producers re-send when they
//! need stronger guarantees.

pub mod broker;
pub mod channel;
pub mod consumer;
pub mod database;
pub mod producer;

#[cfg(test)]
mod tests;

// Re-export commonly used types for convenience
pub use broker::{create_router, AppState, ConsumerCache};
pub use channel::{Channel, ChannelMessage};
pub use consumer::ConsumerEndpoint;
pub use database::{BrokerDatabase, ConsumerItem, MessageRecord};
pub use producer::Producer;
