//! Broker HTTP service for the message queue
//!
//! This module provides the endpoints producers and consumers use to talk
//! to the broker: consumer registration, message fan-out and
//! acknowledgement. Each public handler corresponds to one endpoint and
//! returns 200 with a machine-readable status string; 4xx responses are
//! reserved for protocol errors.
// Delivery is two-phase by design: message rows are committed before the
// first POST to a consumer, and the send outcome is written in a second
// transaction. A consumer that acks within the delivery round-trip still
// finds its row.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    endpoints, status, BrokerResponse, ReceiveMessageInput, RegisterConsumerInput, SendAckInput,
    SendMessageInput, UnregisterConsumerInput,
};
use shared::config::BrokerConfig;
use shared::utils::{message_id, now_seconds};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::database::{BrokerDatabase, ConsumerItem, MessageRecord};

/// In-memory registry of consumers per channel.
///
/// Mutated only by the register/unregister endpoints; reads take a cheap
/// snapshot. The consumers table remains the source of truth and the cache
/// is rebuilt from it on restart.
#[derive(Debug, Default)]
pub struct ConsumerCache {
    consumers: HashMap<String, HashMap<String, ConsumerItem>>,
}

impl ConsumerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.consumers.contains_key(channel)
    }

    pub fn add_consumer(&mut self, channel: &str, name: &str, url: &str) {
        self.consumers
            .entry(channel.to_string())
            .or_default()
            .insert(
                name.to_string(),
                ConsumerItem {
                    channel: channel.to_string(),
                    name: name.to_string(),
                    url: url.to_string(),
                },
            );
    }

    pub fn remove_consumer(&mut self, channel: &str, name: &str) {
        if let Some(channel_consumers) = self.consumers.get_mut(channel) {
            channel_consumers.remove(name);
            if channel_consumers.is_empty() {
                self.consumers.remove(channel);
            }
        }
    }

    /// Snapshot of all consumers registered on a channel.
    pub fn get_consumers(&self, channel: &str) -> Vec<ConsumerItem> {
        self.consumers
            .get(channel)
            .map(|consumers| consumers.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Application state shared across all broker handlers
#[derive(Clone)]
pub struct AppState {
    /// Database handle for the consumers and messages tables. Behind a
    /// Mutex: the SQLite connection is Send but not Sync.
    pub database: Arc<Mutex<BrokerDatabase>>,
    /// In-memory consumer registry
    pub cache: Arc<RwLock<ConsumerCache>>,
    /// Shared HTTP client for delivery POSTs, reused across all requests
    http_client: reqwest::Client,
}

impl AppState {
    /// Create broker state from configuration: opens and initializes the
    /// database, then warms the consumer cache from the consumers table.
    pub async fn new(config: &BrokerConfig) -> shared::Result<Self> {
        let mut database = BrokerDatabase::new(&config.store)?;
        database.initialize().await?;

        let mut cache = ConsumerCache::new();
        for consumer in database.get_consumers().await? {
            cache.add_consumer(&consumer.channel, &consumer.name, &consumer.url);
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_seconds))
            .build()?;

        Ok(Self {
            database: Arc::new(Mutex::new(database)),
            cache: Arc::new(RwLock::new(cache)),
            http_client,
        })
    }
}

/// Creates the broker router and defines all of its routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Unauthenticated health check for load balancers and orchestrators.
        .route("/health", get(health_check))
        .route(endpoints::REGISTER_CONSUMER, post(handle_register_consumer))
        .route(
            endpoints::UNREGISTER_CONSUMER,
            post(handle_unregister_consumer),
        )
        .route(endpoints::SEND_MESSAGE, post(handle_send_message))
        .route(endpoints::ACK_MESSAGE, post(handle_ack_message))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// POST /register-consumer: upsert a consumer row and the cache entry.
pub async fn handle_register_consumer(
    State(state): State<AppState>,
    Json(input): Json<RegisterConsumerInput>,
) -> Json<BrokerResponse> {
    // Cache first so in-flight sends see the consumer even if the row
    // write below loses a race with them.
    state
        .cache
        .write()
        .await
        .add_consumer(&input.channel, &input.consumer_name, &input.url);

    let result = state
        .database
        .lock()
        .await
        .upsert_consumer(&input.channel, &input.consumer_name, &input.url)
        .await;

    match result {
        Ok(()) => {
            info!(
                "Registered consumer '{}' on channel '{}'",
                input.consumer_name, input.channel
            );
            Json(BrokerResponse::new(status::REGISTER_CONSUMER_SUCCESS))
        }
        Err(e) => {
            warn!(
                "Failed to persist consumer '{}' on channel '{}': {:#}",
                input.consumer_name, input.channel, e
            );
            Json(BrokerResponse::new(status::REGISTER_CONSUMER_FAIL))
        }
    }
}

/// POST /unregister-consumer: remove the cache entry and the row.
pub async fn handle_unregister_consumer(
    State(state): State<AppState>,
    Json(input): Json<UnregisterConsumerInput>,
) -> Json<BrokerResponse> {
    state
        .cache
        .write()
        .await
        .remove_consumer(&input.channel, &input.consumer_name);

    let result = state
        .database
        .lock()
        .await
        .delete_consumer(&input.channel, &input.consumer_name)
        .await;

    match result {
        Ok(true) => Json(BrokerResponse::new(status::UNREGISTER_CONSUMER_SUCCESS)),
        Ok(false) => Json(BrokerResponse::new(
            status::UNREGISTER_CONSUMER_NOT_REGISTERED,
        )),
        Err(e) => {
            warn!(
                "Failed to remove consumer '{}' on channel '{}': {:#}",
                input.consumer_name, input.channel, e
            );
            Json(BrokerResponse::new(status::UNREGISTER_CONSUMER_FAIL))
        }
    }
}

/// POST /send-message: fan a message out to every consumer on the channel.
///
/// Phase one persists a row per consumer in a single transaction, phase two
/// attempts the delivery POSTs and records each outcome. The aggregate
/// status is `send_message_success` only when every delivery succeeded.
pub async fn handle_send_message(
    State(state): State<AppState>,
    Json(input): Json<SendMessageInput>,
) -> Json<BrokerResponse> {
    let consumers = state.cache.read().await.get_consumers(&input.channel);
    if consumers.is_empty() {
        debug!("No consumers registered for channel '{}'", input.channel);
        return Json(BrokerResponse::new(status::SEND_MESSAGE_NO_CHANNEL));
    }

    let send_time = now_seconds();
    let records: Vec<MessageRecord> = consumers
        .iter()
        .map(|consumer| MessageRecord {
            id: message_id(&input.channel, &consumer.name, &input.message, send_time),
            created_at: send_time,
            sent_at: None,
            acked_at: None,
            channel: input.channel.clone(),
            consumer_name: consumer.name.clone(),
            message: input.message.clone(),
            acked: false,
            send_status: status::SEND_PENDING.to_string(),
        })
        .collect();

    if let Err(e) = state.database.lock().await.insert_messages(&records).await {
        warn!("Failed to persist message rows: {:#}", e);
        return Json(BrokerResponse::new(status::SEND_MESSAGE_FAIL));
    }

    let mut aggregate = status::SEND_MESSAGE_SUCCESS;
    for (consumer, record) in consumers.iter().zip(records.iter()) {
        let delivery = ReceiveMessageInput {
            message_id: record.id.clone(),
            channel: input.channel.clone(),
            name: consumer.name.clone(),
            message: input.message.clone(),
        };

        let send_status = match state.http_client.post(&consumer.url).json(&delivery).send().await
        {
            Ok(response) if response.status().is_success() => status::SEND_MESSAGE_SUCCESS,
            Ok(response) => {
                warn!(
                    "Consumer '{}' returned {} for message {}",
                    consumer.name,
                    response.status(),
                    record.id
                );
                status::SEND_MESSAGE_FAIL
            }
            Err(e) => {
                warn!(
                    "Delivery to consumer '{}' at {} failed: {}",
                    consumer.name, consumer.url, e
                );
                status::SEND_MESSAGE_FAIL
            }
        };
        if send_status == status::SEND_MESSAGE_FAIL {
            aggregate = status::SEND_MESSAGE_FAIL;
        }

        let update = state
            .database
            .lock()
            .await
            .mark_sent(&record.id, send_time, send_status)
            .await;
        if let Err(e) = update {
            warn!("Failed to record send status for {}: {:#}", record.id, e);
            aggregate = status::SEND_MESSAGE_FAIL;
        }
    }

    Json(BrokerResponse::new(aggregate))
}

/// POST /ack-message: mark a message row acknowledged.
pub async fn handle_ack_message(
    State(state): State<AppState>,
    Json(input): Json<SendAckInput>,
) -> Json<BrokerResponse> {
    let result = state
        .database
        .lock()
        .await
        .ack_message(&input.message_id, now_seconds())
        .await;

    match result {
        Ok(true) => Json(BrokerResponse::new(status::ACK_SUCCESS)),
        Ok(false) => {
            debug!("Ack for unknown message id {}", input.message_id);
            Json(BrokerResponse::new(status::ACK_FAIL))
        }
        Err(e) => {
            warn!("Failed to ack message {}: {:#}", input.message_id, e);
            Json(BrokerResponse::new(status::ACK_FAIL))
        }
    }
}

/// Protocol-level errors for the queue HTTP surfaces.
///
/// Broker handlers answer 200 with a status string for expected outcomes;
/// this type covers the cases where the request itself is wrong, and is
/// shared with the consumer endpoint which uses 4xx responses per the
/// delivery contract.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Converts `ApiError` into an HTTP response; axum calls this when a
/// handler returns the `Err` variant.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
