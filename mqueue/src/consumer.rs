//! Consumer endpoint for the message queue
//!
//! Hosts the HTTP endpoint the broker delivers messages to, keeps the local
//! registry of per-channel callbacks, and provides the client calls for
//! registering with the broker and acknowledging messages.
// Callbacks never run on the delivery request itself: the broker holds the
// delivery connection open until it gets a response, and the ack is another
// HTTP call back into the broker. Acking inline would deadlock both sides,
// so dispatch happens on a spawned task and the handler returns immediately.

use anyhow::Context;
use axum::{extract::State, routing::post, Json, Router};
use futures_util::future::BoxFuture;
use shared::api::{
    endpoints, status, BrokerResponse, ReceiveMessageInput, RegisterConsumerInput, SendAckInput,
};
use shared::config::ConsumerConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::ApiError;
use crate::channel::{Channel, ChannelMessage};

/// An erased message callback: takes the raw JSON body, returns a future.
pub type MessageCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry entry for one channel: a decode check plus the callbacks to run.
struct ChannelEntry {
    /// Validates that a raw body decodes as this channel's message type
    validate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    callbacks: Vec<MessageCallback>,
}

/// Local registry of channels, consumer names and callbacks.
#[derive(Default)]
pub struct ConsumerRegistry {
    channels: HashMap<String, ChannelEntry>,
    registered_names: HashSet<String>,
}

/// State shared with the receive handler.
#[derive(Clone)]
pub struct ConsumerState {
    registry: Arc<RwLock<ConsumerRegistry>>,
    http_client: reqwest::Client,
    broker_url: String,
}

impl ConsumerState {
    /// Acknowledge a message with the broker.
    pub async fn ack_message(&self, message_id: &str) -> String {
        let input = SendAckInput {
            message_id: message_id.to_string(),
        };
        let url = format!("{}{}", self.broker_url, endpoints::ACK_MESSAGE);

        match self.http_client.post(&url).json(&input).send().await {
            Ok(response) if response.status().is_success() => status::ACK_SUCCESS.to_string(),
            Ok(response) => {
                warn!("Broker returned {} for ack of {}", response.status(), message_id);
                status::ACK_FAIL.to_string()
            }
            Err(e) => {
                warn!("Failed to ack message {}: {}", message_id, e);
                status::ACK_FAIL.to_string()
            }
        }
    }
}

/// A consumer process: registry, receive endpoint and broker client calls.
pub struct ConsumerEndpoint {
    config: ConsumerConfig,
    state: ConsumerState,
}

impl ConsumerEndpoint {
    pub fn new(config: ConsumerConfig) -> shared::Result<Self> {
        config.validate()?;
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to create consumer HTTP client")?;

        let state = ConsumerState {
            registry: Arc::new(RwLock::new(ConsumerRegistry::default())),
            http_client,
            broker_url: config.broker_url.clone(),
        };

        Ok(Self { config, state })
    }

    /// Register a callback for a channel in the local registry only.
    ///
    /// Used by `register_consumer` and directly by tests that have no
    /// broker to talk to.
    pub async fn register_callback<T, F, Fut>(
        &self,
        consumer_name: &str,
        channel: &Channel<T>,
        callback: F,
    ) where
        T: ChannelMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let channel_name = channel.name;
        let erased: MessageCallback = Arc::new(move |raw: String| {
            match serde_json::from_str::<T>(&raw) {
                Ok(message) => Box::pin(callback(message)),
                Err(e) => {
                    // The endpoint validated the body before dispatch, so
                    // this only fires if the registry changed in between.
                    warn!("Dropping undecodable message on '{}': {}", channel_name, e);
                    Box::pin(async {})
                }
            }
        });

        let mut registry = self.state.registry.write().await;
        let entry = registry
            .channels
            .entry(channel.name.to_string())
            .or_insert_with(|| ChannelEntry {
                validate: Arc::new(|raw: &str| serde_json::from_str::<T>(raw).is_ok()),
                callbacks: Vec::new(),
            });
        entry.callbacks.push(erased);
        registry.registered_names.insert(consumer_name.to_string());
    }

    /// Register a callback locally and announce the registration to the
    /// broker. Returns the broker's status string.
    pub async fn register_consumer<T, F, Fut>(
        &self,
        consumer_name: &str,
        channel: &Channel<T>,
        callback: F,
    ) -> shared::Result<String>
    where
        T: ChannelMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register_callback(consumer_name, channel, callback).await;

        let input = RegisterConsumerInput {
            channel: channel.name.to_string(),
            consumer_name: consumer_name.to_string(),
            url: self.config.consumer_url.clone(),
        };
        let url = format!("{}{}", self.config.broker_url, endpoints::REGISTER_CONSUMER);

        let response = self
            .state
            .http_client
            .post(&url)
            .json(&input)
            .send()
            .await
            .with_context(|| format!("Failed to reach broker at {}", url))?;

        if !response.status().is_success() {
            return Ok(status::REGISTER_CONSUMER_FAIL.to_string());
        }

        let body: BrokerResponse = response
            .json()
            .await
            .context("Invalid broker response to register-consumer")?;

        info!(
            "Registered consumer '{}' on channel '{}': {}",
            consumer_name, channel.name, body.status
        );
        Ok(body.status)
    }

    /// Acknowledge a message with the broker.
    pub async fn ack_message(&self, message_id: &str) -> String {
        self.state.ack_message(message_id).await
    }

    /// Handler state, exposed for tests that drive the handler directly.
    pub fn state(&self) -> ConsumerState {
        self.state.clone()
    }

    /// Build the receive-message router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(endpoints::RECEIVE_MESSAGE, post(handle_receive_message))
            .with_state(self.state.clone())
    }

    /// Bind the configured listen address and serve the receive endpoint
    /// on a spawned task.
    pub async fn serve(&self) -> shared::Result<JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_address))?;
        info!(
            "Consumer endpoint listening on {}",
            self.config.listen_address
        );

        let router = self.router();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("Consumer endpoint server stopped: {}", e);
            }
        }))
    }
}

/// POST /receive-message: validate, dispatch off the hot path, ack once.
pub async fn handle_receive_message(
    State(state): State<ConsumerState>,
    Json(input): Json<ReceiveMessageInput>,
) -> Result<&'static str, ApiError> {
    let callbacks = {
        let registry = state.registry.read().await;

        let entry = registry
            .channels
            .get(&input.channel)
            .ok_or_else(|| ApiError::NotFound("Channel not found in consumer".to_string()))?;

        if !(entry.validate)(&input.message) {
            return Err(ApiError::BadRequest(
                "Invalid message format for provided channel name".to_string(),
            ));
        }

        if !registry.registered_names.contains(&input.name) {
            return Err(ApiError::NotFound(
                "Consumer not registered for this channel".to_string(),
            ));
        }

        entry.callbacks.clone()
    };

    // Run callbacks on a spawned task so this handler can return and the
    // broker can close the delivery connection before the ack arrives.
    let message_id = input.message_id.clone();
    let raw = input.message.clone();
    tokio::spawn(async move {
        for callback in &callbacks {
            callback(raw.clone()).await;
        }
        // One ack per message, after all callbacks have run.
        let ack_status = state.ack_message(&message_id).await;
        debug!("Acked message {}: {}", message_id, ack_status);
    });

    Ok("done")
}
