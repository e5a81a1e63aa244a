//! Durable message records
//!
//! Every delivery to a consumer gets its own row, keyed by the
//! deterministic message id. Rows are inserted in one transaction before
//! any delivery attempt and updated afterwards, which guarantees that an
//! acknowledgement arriving mid-send always finds its row.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// A message row as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    /// Deterministic hash of (channel, consumer, body, send time)
    pub id: String,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub acked_at: Option<i64>,
    pub channel: String,
    pub consumer_name: String,
    /// JSON-encoded message body
    pub message: String,
    pub acked: bool,
    /// One of the send status strings from `shared::api::status`
    pub send_status: String,
}

/// Create the messages table.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            sent_at INTEGER,
            acked_at INTEGER,
            channel TEXT NOT NULL,
            consumer_name TEXT NOT NULL,
            message TEXT NOT NULL,
            acked INTEGER NOT NULL DEFAULT 0,
            send_status TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create messages table")?;

    Ok(())
}

/// Insert a batch of message rows inside a single transaction.
pub fn insert_messages(conn: &mut Connection, messages: &[MessageRecord]) -> Result<()> {
    let tx = conn
        .transaction()
        .context("Failed to start message insert transaction")?;

    for record in messages {
        tx.execute(
            r#"
            INSERT OR REPLACE INTO messages
                (id, created_at, sent_at, acked_at, channel, consumer_name, message, acked, send_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.created_at,
                record.sent_at,
                record.acked_at,
                record.channel,
                record.consumer_name,
                record.message,
                record.acked,
                record.send_status,
            ],
        )
        .context("Failed to insert message row")?;
    }

    tx.commit().context("Failed to commit message rows")?;
    Ok(())
}

/// Record the outcome of a delivery attempt.
pub fn mark_sent(conn: &Connection, message_id: &str, sent_at: i64, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET sent_at = ?1, send_status = ?2 WHERE id = ?3",
        params![sent_at, status, message_id],
    )
    .context("Failed to update message send status")?;

    Ok(())
}

/// Mark a message acknowledged; returns false when the id is unknown.
pub fn ack(conn: &Connection, message_id: &str, acked_at: i64) -> Result<bool> {
    let affected = conn
        .execute(
            "UPDATE messages SET acked = 1, acked_at = ?1 WHERE id = ?2",
            params![acked_at, message_id],
        )
        .context("Failed to ack message")?;

    Ok(affected > 0)
}

/// Fetch every message row for a channel, oldest first.
pub fn get_for_channel(conn: &Connection, channel: &str) -> Result<Vec<MessageRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, created_at, sent_at, acked_at, channel, consumer_name, message, acked, send_status
            FROM messages WHERE channel = ?1 ORDER BY created_at ASC
            "#,
        )
        .context("Failed to prepare message query")?;

    let rows = stmt
        .query_map(params![channel], |row| {
            Ok(MessageRecord {
                id: row.get(0)?,
                created_at: row.get(1)?,
                sent_at: row.get(2)?,
                acked_at: row.get(3)?,
                channel: row.get(4)?,
                consumer_name: row.get(5)?,
                message: row.get(6)?,
                acked: row.get(7)?,
                send_status: row.get(8)?,
            })
        })
        .context("Failed to query messages")?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.context("Failed to read message row")?);
    }
    Ok(messages)
}

/// Load a single message row by id.
pub fn get(conn: &Connection, message_id: &str) -> Result<Option<MessageRecord>> {
    conn.query_row(
        r#"
        SELECT id, created_at, sent_at, acked_at, channel, consumer_name, message, acked, send_status
        FROM messages WHERE id = ?1
        "#,
        params![message_id],
        |row| {
            Ok(MessageRecord {
                id: row.get(0)?,
                created_at: row.get(1)?,
                sent_at: row.get(2)?,
                acked_at: row.get(3)?,
                channel: row.get(4)?,
                consumer_name: row.get(5)?,
                message: row.get(6)?,
                acked: row.get(7)?,
                send_status: row.get(8)?,
            })
        },
    )
    .optional()
    .context("Failed to query message row")
}
