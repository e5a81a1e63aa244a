//! API types for the message queue HTTP surface
//!
//! This module defines the request bodies exchanged between producers, the
//! broker and consumers, together with the machine-readable status strings
//! the broker returns. Keeping them in the shared crate ensures the broker
//! and its clients cannot drift apart.

use serde::{Deserialize, Serialize};

/// Endpoint paths served by the broker and by consumers.
pub mod endpoints {
    /// Broker: upsert a consumer registration
    pub const REGISTER_CONSUMER: &str = "/register-consumer";
    /// Broker: remove a consumer registration
    pub const UNREGISTER_CONSUMER: &str = "/unregister-consumer";
    /// Broker: fan a message out to a channel's consumers
    pub const SEND_MESSAGE: &str = "/send-message";
    /// Broker: acknowledge a delivered message
    pub const ACK_MESSAGE: &str = "/ack-message";
    /// Consumer: receive a message from the broker
    pub const RECEIVE_MESSAGE: &str = "/receive-message";
}

/// Machine-readable status strings returned by the broker endpoints.
///
/// These are part of the wire contract; clients match on them rather than
/// on HTTP status codes.
pub mod status {
    pub const ACK_SUCCESS: &str = "ack_success";
    pub const ACK_FAIL: &str = "ack_failed";

    pub const REGISTER_CONSUMER_SUCCESS: &str = "register_consumer_success";
    pub const REGISTER_CONSUMER_FAIL: &str = "register_consumer_failed";

    pub const UNREGISTER_CONSUMER_SUCCESS: &str = "unregister_consumer_success";
    pub const UNREGISTER_CONSUMER_FAIL: &str = "unregister_consumer_failed";
    pub const UNREGISTER_CONSUMER_NOT_REGISTERED: &str = "unregister_consumer_not_registered";

    pub const SEND_MESSAGE_SUCCESS: &str = "send_message_success";
    pub const SEND_MESSAGE_FAIL: &str = "send_message_failed";
    pub const SEND_MESSAGE_NO_CHANNEL: &str = "send_message_no_channel";

    /// Persisted on a message row before the first delivery attempt
    pub const SEND_PENDING: &str = "pending";
}

/// Request body for POST /send-message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageInput {
    pub channel: String,
    /// JSON-encoded message body; the schema is channel-specific
    pub message: String,
}

/// Request body for POST /ack-message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendAckInput {
    pub message_id: String,
}

/// Request body for POST /receive-message (broker to consumer)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiveMessageInput {
    pub message_id: String,
    pub channel: String,
    /// The registered consumer name this delivery is addressed to
    pub name: String,
    pub message: String,
}

/// Request body for POST /register-consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterConsumerInput {
    pub channel: String,
    pub consumer_name: String,
    /// Full URL of the consumer's receive endpoint
    pub url: String,
}

/// Request body for POST /unregister-consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnregisterConsumerInput {
    pub channel: String,
    pub consumer_name: String,
}

/// Broker response wrapper: a bare status string
///
/// The broker answers every request with 200 plus one of the
/// [`status`] strings; protocol-level failures (malformed JSON, unknown
/// routes) use 4xx responses instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerResponse {
    pub status: String,
}

impl BrokerResponse {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}
