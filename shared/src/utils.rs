//! Utility functions for the task orchestration system
//!
//! This module provides common helpers used across the orchestrator and the
//! message queue: timestamp access, deterministic message ids and the
//! output-merge contract shared by all run status writers.

use blake3::Hasher;
use chrono::Utc;
use serde_json::Value;

/// Get the current Unix timestamp in seconds
pub fn now_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Get the current Unix timestamp in milliseconds
///
/// Used as the task version key; millisecond resolution keeps versions
/// monotonic for back-to-back writes within one process.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Compute the deterministic id for a message delivery
///
/// The id is the BLAKE3 hash (hex, 64 characters) of
/// `channel | consumer_name | body | send_time`. Re-sending the same
/// payload to the same consumer at the same send time therefore produces
/// the same id; producers that need distinct deliveries must vary
/// `send_time` or the body.
pub fn message_id(channel: &str, consumer_name: &str, body: &str, send_time: i64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(channel.as_bytes());
    hasher.update(consumer_name.as_bytes());
    hasher.update(body.as_bytes());
    hasher.update(send_time.to_le_bytes().as_slice());
    hasher.finalize().to_hex().to_string()
}

/// Merge a supplied output document over a stored one
///
/// Top-level keys from `supplied` win; nested structures are replaced
/// wholesale rather than merged recursively. A non-object on either side
/// means the supplied value replaces the stored one entirely.
pub fn merge_output(stored: Option<Value>, supplied: Option<Value>) -> Option<Value> {
    match (stored, supplied) {
        (stored, None) => stored,
        (None, supplied) => supplied,
        (Some(Value::Object(mut base)), Some(Value::Object(over))) => {
            for (key, value) in over {
                base.insert(key, value);
            }
            Some(Value::Object(base))
        }
        (Some(_), supplied) => supplied,
    }
}
