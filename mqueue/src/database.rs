//! Database management for the message queue broker
//!
//! This module handles SQLite operations for the broker's two tables: the
//! consumer registry and the durable message records. The message table is
//! the source of truth for delivery bookkeeping; rows are written before any
//! delivery attempt so that a fast acknowledgement can never race a row
//! that does not exist yet.

// Table-specific database modules
mod db_consumers;
mod db_messages;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::config::StoreConfig;
use std::path::PathBuf;
use tracing::{debug, info};

pub use db_consumers::ConsumerItem;
pub use db_messages::MessageRecord;

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "mqueue.db";

/// SQLite database manager for the broker.
/// The `connection` field is an `Option<Connection>` to allow for lazy
/// initialization of the connection.
pub struct BrokerDatabase {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl BrokerDatabase {
    /// Create a new database manager for the configured data directory.
    /// Ensures the data directory exists, creating it if necessary.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds: config.busy_timeout_seconds,
        })
    }

    /// Initialize the database by creating the necessary tables.
    /// Idempotent; safe to call on every broker startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing broker database at {}", self.db_path.display());

        let conn = self.get_connection()?;
        db_consumers::create_tables(conn)?;
        db_messages::create_tables(conn)?;

        info!("Broker database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection.
    /// If the connection doesn't exist, it's created and configured.
    fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode lets the ack handler read/write while a send
            // transaction is still open.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// Insert or update a consumer registration.
    pub async fn upsert_consumer(&mut self, channel: &str, name: &str, url: &str) -> Result<()> {
        let conn = self.get_connection()?;
        db_consumers::upsert_consumer(conn, channel, name, url)
    }

    /// Remove a consumer registration. Returns false when no row matched.
    pub async fn delete_consumer(&mut self, channel: &str, name: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        db_consumers::delete_consumer(conn, channel, name)
    }

    /// Fetch every registered consumer, used to warm the in-memory cache
    /// at broker startup.
    pub async fn get_consumers(&mut self) -> Result<Vec<ConsumerItem>> {
        let conn = self.get_connection()?;
        db_consumers::get_all(conn)
    }

    /// Persist a batch of message rows in a single transaction.
    ///
    /// This is phase one of the two-phase send: every row must be committed
    /// before the first delivery POST goes out.
    pub async fn insert_messages(&mut self, messages: &[MessageRecord]) -> Result<()> {
        let conn = self.get_connection()?;
        db_messages::insert_messages(conn, messages)?;
        debug!("Persisted {} message rows", messages.len());
        Ok(())
    }

    /// Record the outcome of a delivery attempt (phase two of the send).
    pub async fn mark_sent(&mut self, message_id: &str, sent_at: i64, status: &str) -> Result<()> {
        let conn = self.get_connection()?;
        db_messages::mark_sent(conn, message_id, sent_at, status)
    }

    /// Mark a message acknowledged. Returns false when the id is unknown.
    pub async fn ack_message(&mut self, message_id: &str, acked_at: i64) -> Result<bool> {
        let conn = self.get_connection()?;
        db_messages::ack(conn, message_id, acked_at)
    }

    /// Load a single message row by id.
    pub async fn get_message(&mut self, message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.get_connection()?;
        db_messages::get(conn, message_id)
    }

    /// Fetch every message row for a channel, oldest first.
    pub async fn get_messages(&mut self, channel: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.get_connection()?;
        db_messages::get_for_channel(conn, channel)
    }
}
