//! Tests for the consumer endpoint and channel types

use crate::broker::ApiError;
use crate::channel::Channel;
use crate::consumer::{handle_receive_message, ConsumerEndpoint};
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use shared::api::ReceiveMessageInput;
use shared::config::ConsumerConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestMessage {
    task_id: String,
    run_id: String,
}

const TEST_CHANNEL: Channel<TestMessage> = Channel::new("test_channel");

fn test_endpoint() -> ConsumerEndpoint {
    // Port 1 is closed; ack attempts fail fast and are only logged.
    ConsumerEndpoint::new(ConsumerConfig {
        broker_url: "http://127.0.0.1:1".to_string(),
        consumer_url: "http://127.0.0.1:5800/receive-message".to_string(),
        listen_address: "127.0.0.1:5800".to_string(),
    })
    .unwrap()
}

fn delivery(channel: &str, name: &str, message: &str) -> ReceiveMessageInput {
    ReceiveMessageInput {
        message_id: "m1".to_string(),
        channel: channel.to_string(),
        name: name.to_string(),
        message: message.to_string(),
    }
}

#[test]
fn test_channel_encode_decode_round_trip() {
    let message = TestMessage {
        task_id: "t1".to_string(),
        run_id: "r1".to_string(),
    };

    let encoded = TEST_CHANNEL.encode(&message).unwrap();
    let decoded = TEST_CHANNEL.decode(&encoded).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_channel_decode_rejects_wrong_shape() {
    assert!(TEST_CHANNEL.decode("{\"unexpected\":true}").is_err());
    assert!(TEST_CHANNEL.decode("not json").is_err());
}

#[tokio::test]
async fn test_receive_dispatches_to_callback() {
    let endpoint = test_endpoint();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    endpoint
        .register_callback("alerts", &TEST_CHANNEL, move |message: TestMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .await;

    let result = handle_receive_message(
        State(endpoint.state()),
        Json(delivery(
            "test_channel",
            "alerts",
            "{\"task_id\":\"t1\",\"run_id\":\"r1\"}",
        )),
    )
    .await;
    assert_eq!(result.unwrap(), "done");

    // The callback runs on a spawned task after the handler returns.
    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback did not run")
        .unwrap();
    assert_eq!(received.task_id, "t1");
    assert_eq!(received.run_id, "r1");
}

#[tokio::test]
async fn test_receive_unknown_channel_is_not_found() {
    let endpoint = test_endpoint();

    let result = handle_receive_message(
        State(endpoint.state()),
        Json(delivery("missing_channel", "alerts", "{}")),
    )
    .await;
    assert!(matches!(result, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn test_receive_undecodable_message_is_bad_request() {
    let endpoint = test_endpoint();
    endpoint
        .register_callback("alerts", &TEST_CHANNEL, |_message: TestMessage| async {})
        .await;

    let result = handle_receive_message(
        State(endpoint.state()),
        Json(delivery("test_channel", "alerts", "{\"nope\":1}")),
    )
    .await;
    assert!(matches!(result, Err(ApiError::BadRequest(_))));
}

#[tokio::test]
async fn test_receive_unregistered_name_is_not_found() {
    let endpoint = test_endpoint();
    endpoint
        .register_callback("alerts", &TEST_CHANNEL, |_message: TestMessage| async {})
        .await;

    let result = handle_receive_message(
        State(endpoint.state()),
        Json(delivery(
            "test_channel",
            "somebody_else",
            "{\"task_id\":\"t1\",\"run_id\":\"r1\"}",
        )),
    )
    .await;
    assert!(matches!(result, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn test_multiple_callbacks_all_run() {
    let endpoint = test_endpoint();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for tag in ["first", "second"] {
        let tx = tx.clone();
        endpoint
            .register_callback("alerts", &TEST_CHANNEL, move |_message: TestMessage| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(tag);
                }
            })
            .await;
    }

    handle_receive_message(
        State(endpoint.state()),
        Json(delivery(
            "test_channel",
            "alerts",
            "{\"task_id\":\"t1\",\"run_id\":\"r1\"}",
        )),
    )
    .await
    .unwrap();

    // Callbacks for one message run sequentially in registration order.
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((first, second), ("first", "second"));
}
