//! Task version table
//!
//! Tasks are stored append-only: every identity or status change writes a
//! new row keyed by `(task_id, version)`. Only the row with the greatest
//! version for an id is authoritative, so every read goes through the
//! latest-version join below. `last_active` is the one field updated in
//! place, because liveness heartbeats must not create versions.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// A task version row as stored in the database.
///
/// JSON columns (`metadata`, `tags`, `schedule_sets`) are kept as
/// `serde_json::Value` here; the task model layer gives them shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: String,
    /// Version timestamp in unix milliseconds
    pub version: i64,
    pub metadata: Value,
    pub tags: Value,
    pub name: String,
    pub description: String,
    pub schedule_sets: Value,
    pub thread_group: String,
    /// Most recent liveness heartbeat, unix seconds
    pub last_active: i64,
    pub status: String,
    pub notes: Option<String>,
}

/// Create the tasks table.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            tags TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            schedule_sets TEXT NOT NULL,
            thread_group TEXT NOT NULL,
            last_active INTEGER NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            PRIMARY KEY (task_id, version)
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    Ok(())
}

fn row_to_task(row: &Row) -> rusqlite::Result<TaskRow> {
    let metadata: String = row.get(2)?;
    let tags: String = row.get(3)?;
    let schedule_sets: String = row.get(6)?;

    Ok(TaskRow {
        task_id: row.get(0)?,
        version: row.get(1)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        tags: serde_json::from_str(&tags).unwrap_or(Value::Null),
        name: row.get(4)?,
        description: row.get(5)?,
        schedule_sets: serde_json::from_str(&schedule_sets).unwrap_or(Value::Null),
        thread_group: row.get(7)?,
        last_active: row.get(8)?,
        status: row.get(9)?,
        notes: row.get(10)?,
    })
}

const TASK_COLUMNS: &str = "task_id, version, metadata, tags, name, description, \
                            schedule_sets, thread_group, last_active, status, notes";

/// Insert or replace a task version row.
pub fn upsert(conn: &Connection, task: &TaskRow) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO tasks
            (task_id, version, metadata, tags, name, description,
             schedule_sets, thread_group, last_active, status, notes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            task.task_id,
            task.version,
            task.metadata.to_string(),
            task.tags.to_string(),
            task.name,
            task.description,
            task.schedule_sets.to_string(),
            task.thread_group,
            task.last_active,
            task.status,
            task.notes,
        ],
    )
    .context("Failed to upsert task version")?;

    Ok(())
}

/// Latest version row for one task id.
pub fn get_latest(conn: &Connection, task_id: &str) -> Result<Option<TaskRow>> {
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE task_id = ?1
        ORDER BY version DESC
        LIMIT 1
        "#
    );

    conn.query_row(&sql, params![task_id], |row| row_to_task(row))
        .optional()
        .context("Failed to query latest task version")
}

/// Latest version row for every task id.
pub fn get_all_latest(conn: &Connection) -> Result<Vec<TaskRow>> {
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks t
        JOIN (
            SELECT task_id AS latest_id, MAX(version) AS latest_version
            FROM tasks
            GROUP BY task_id
        ) latest
        ON t.task_id = latest.latest_id AND t.version = latest.latest_version
        "#
    );

    let mut stmt = conn
        .prepare(&sql)
        .context("Failed to prepare latest tasks query")?;

    let rows = stmt
        .query_map([], |row| row_to_task(row))
        .context("Failed to query latest task versions")?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("Failed to read task row")?);
    }
    Ok(tasks)
}

/// Refresh `last_active` in place on one task version.
pub fn update_last_active(
    conn: &Connection,
    task_id: &str,
    version: i64,
    last_active: i64,
) -> Result<()> {
    conn.execute(
        // MAX keeps last_active monotonic within a version even if two
        // workers heartbeat out of order.
        "UPDATE tasks SET last_active = MAX(last_active, ?1) WHERE task_id = ?2 AND version = ?3",
        params![last_active, task_id, version],
    )
    .context("Failed to update task last_active")?;

    Ok(())
}
