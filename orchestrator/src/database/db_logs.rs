//! Append-only log entries
//!
//! Structured events from the scheduler, runner and run model. Entries are
//! only ever inserted and pruned by age; there is no update path.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;

/// A log entry as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub entry_id: String,
    /// Creation time, unix seconds
    pub entry_created: i64,
    /// Subsystem that wrote the entry, e.g. "scheduler" or "task_runner"
    pub entry_source: String,
    pub entry_category: String,
    pub entry_text: String,
    pub entry_json: Value,
}

/// Create the log entries table.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS logs (
            entry_id TEXT PRIMARY KEY,
            entry_created INTEGER NOT NULL,
            entry_source TEXT NOT NULL,
            entry_category TEXT NOT NULL,
            entry_text TEXT NOT NULL,
            entry_json TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create log entries table")?;

    Ok(())
}

/// Append one entry. Plain INSERT: log entries are never merged.
pub fn add(conn: &Connection, entry: &LogEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO logs
            (entry_id, entry_created, entry_source, entry_category, entry_text, entry_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            entry.entry_id,
            entry.entry_created,
            entry.entry_source,
            entry.entry_category,
            entry.entry_text,
            entry.entry_json.to_string(),
        ],
    )
    .context("Failed to insert log entry")?;

    Ok(())
}

/// Delete entries created before the cutoff; returns the count.
pub fn prune(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn
        .execute(
            "DELETE FROM logs WHERE entry_created < ?1",
            params![cutoff],
        )
        .context("Failed to prune log entries")?;

    Ok(deleted)
}

/// Fetch entries, optionally restricted to one source, oldest first.
pub fn get_entries(conn: &Connection, source: Option<&str>) -> Result<Vec<LogEntry>> {
    let mut sql = String::from(
        "SELECT entry_id, entry_created, entry_source, entry_category, entry_text, entry_json \
         FROM logs",
    );
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(source) = source {
        sql.push_str(" WHERE entry_source = ?1");
        bindings.push(Box::new(source.to_string()));
    }
    sql.push_str(" ORDER BY entry_created ASC");

    let mut stmt = conn.prepare(&sql).context("Failed to prepare log query")?;
    let params: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            let json: String = row.get(5)?;
            Ok(LogEntry {
                entry_id: row.get(0)?,
                entry_created: row.get(1)?,
                entry_source: row.get(2)?,
                entry_category: row.get(3)?,
                entry_text: row.get(4)?,
                entry_json: serde_json::from_str(&json).unwrap_or(Value::Null),
            })
        })
        .context("Failed to query log entries")?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.context("Failed to read log entry")?);
    }
    Ok(entries)
}
