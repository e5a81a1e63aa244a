//! Consumer registry table
//!
//! One row per `(channel, name)` pair; the payload is the delivery URL.
//! The table is only read in bulk at broker startup to rebuild the
//! in-memory cache, so no secondary indexes are needed.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// A registered consumer as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerItem {
    pub channel: String,
    pub name: String,
    pub url: String,
}

/// Create the consumers table.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS consumers (
            channel TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            PRIMARY KEY (channel, name)
        )
        "#,
        [],
    )
    .context("Failed to create consumers table")?;

    Ok(())
}

/// Insert or replace a consumer registration.
pub fn upsert_consumer(conn: &Connection, channel: &str, name: &str, url: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO consumers (channel, name, url) VALUES (?1, ?2, ?3)",
        params![channel, name, url],
    )
    .context("Failed to upsert consumer")?;

    Ok(())
}

/// Delete a consumer registration; returns false when no row matched.
pub fn delete_consumer(conn: &Connection, channel: &str, name: &str) -> Result<bool> {
    let affected = conn
        .execute(
            "DELETE FROM consumers WHERE channel = ?1 AND name = ?2",
            params![channel, name],
        )
        .context("Failed to delete consumer")?;

    Ok(affected > 0)
}

/// Fetch every consumer registration.
pub fn get_all(conn: &Connection) -> Result<Vec<ConsumerItem>> {
    let mut stmt = conn
        .prepare("SELECT channel, name, url FROM consumers")
        .context("Failed to prepare consumer query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok(ConsumerItem {
                channel: row.get(0)?,
                name: row.get(1)?,
                url: row.get(2)?,
            })
        })
        .context("Failed to query consumers")?;

    let mut consumers = Vec::new();
    for row in rows {
        consumers.push(row.context("Failed to read consumer row")?);
    }
    Ok(consumers)
}
