//! Producer client for the message queue
//!
//! A thin HTTP client that publishes typed messages to the broker's
//! send-message endpoint and reports the broker's status string back to the
//! caller.

use anyhow::Context;
use shared::api::{endpoints, status, BrokerResponse, SendMessageInput};
use shared::OrchestratorError;
use tracing::debug;

use crate::channel::{Channel, ChannelMessage};

/// Publishes messages to a broker.
#[derive(Debug, Clone)]
pub struct Producer {
    broker_url: String,
    /// Shared HTTP client, reused across all sends
    http_client: reqwest::Client,
}

impl Producer {
    /// Create a producer for the broker at the given base URL,
    /// e.g. `http://127.0.0.1:5801`.
    pub fn new(broker_url: impl Into<String>) -> shared::Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to create producer HTTP client")?;

        Ok(Self {
            broker_url: broker_url.into(),
            http_client,
        })
    }

    /// Base URL of the broker this producer talks to.
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Send a message on a channel.
    ///
    /// Returns the broker's status string (`send_message_success`,
    /// `send_message_no_channel`, ...). Transport failures surface as
    /// errors so callers can distinguish "broker said no" from "broker
    /// unreachable".
    pub async fn send_message<T: ChannelMessage>(
        &self,
        channel: &Channel<T>,
        message: &T,
    ) -> shared::Result<String> {
        let input = SendMessageInput {
            channel: channel.name.to_string(),
            message: channel.encode(message)?,
        };

        let url = format!("{}{}", self.broker_url, endpoints::SEND_MESSAGE);
        let response = self
            .http_client
            .post(&url)
            .json(&input)
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::Broker(format!("Failed to reach broker at {}: {}", url, e))
            })?;

        if !response.status().is_success() {
            return Ok(status::SEND_MESSAGE_FAIL.to_string());
        }

        let body: BrokerResponse = response.json().await.map_err(|e| {
            OrchestratorError::Broker(format!("Invalid broker response from {}: {}", url, e))
        })?;

        debug!(
            "Sent message on channel '{}': {}",
            channel.name, body.status
        );
        Ok(body.status)
    }
}
