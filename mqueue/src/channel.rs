//! Typed channels for the message queue
//!
//! A channel pairs a wire name with the message type that travels on it, so
//! that producers and consumers agree on the payload schema at compile time.
//! The bytes on the wire are always UTF-8 JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::OrchestratorError;
use std::marker::PhantomData;

/// Bound for message payloads: anything serde can move to and from JSON.
pub trait ChannelMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> ChannelMessage for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A named channel carrying messages of type `T`.
///
/// Channels are cheap value types; define them as constants next to the
/// message type they carry:
///
/// ```
/// use mqueue::Channel;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping {
///     seq: u64,
/// }
///
/// const PING: Channel<Ping> = Channel::new("ping");
/// ```
#[derive(Debug)]
pub struct Channel<T> {
    /// Wire name of the channel, used as the routing key everywhere
    pub name: &'static str,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Channel<T> {}

impl<T: ChannelMessage> Channel<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _message: PhantomData,
        }
    }

    /// Encode a message for the wire.
    pub fn encode(&self, message: &T) -> shared::Result<String> {
        serde_json::to_string(message).map_err(|e| {
            OrchestratorError::Decode(format!(
                "Failed to encode message for channel '{}': {}",
                self.name, e
            ))
            .into()
        })
    }

    /// Decode a message received from the wire.
    pub fn decode(&self, raw: &str) -> shared::Result<T> {
        serde_json::from_str(raw).map_err(|e| {
            OrchestratorError::Decode(format!(
                "Invalid message format for channel '{}': {}",
                self.name, e
            ))
            .into()
        })
    }
}
