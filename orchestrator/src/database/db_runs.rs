//! Run table
//!
//! One row per run, keyed by the run's UUID. The secondary indexes mirror
//! the three access paths that dominate: due detection (task + scheduled
//! time + type), schedule-scoped history (plus set id) and the runner's
//! queued/running scans (task + status).

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// A run row as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: String,
    pub task_id: String,
    pub set_id: String,
    pub run_type: String,
    /// The cron tick this run represents, unix seconds
    pub scheduled_time: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub last_active: Option<i64>,
    /// Snapshot of the schedule set config at creation
    pub config: Value,
    pub status: String,
    pub output: Option<Value>,
}

/// Create the runs table and its indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            set_id TEXT NOT NULL,
            run_type TEXT NOT NULL,
            scheduled_time INTEGER NOT NULL,
            start_time INTEGER,
            end_time INTEGER,
            last_active INTEGER,
            config TEXT NOT NULL,
            status TEXT NOT NULL,
            output TEXT
        )
        "#,
        [],
    )
    .context("Failed to create runs table")?;

    // Critical indexes for the performance of fetching runs; the run table
    // grows linearly with history.
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_runs_task_scheduled
            ON runs (task_id, scheduled_time, run_type);
        CREATE INDEX IF NOT EXISTS idx_runs_task_set_scheduled
            ON runs (task_id, scheduled_time, set_id, run_type);
        CREATE INDEX IF NOT EXISTS idx_runs_task_status
            ON runs (task_id, status);
        "#,
    )
    .context("Failed to create run indexes")?;

    Ok(())
}

fn row_to_run(row: &Row) -> rusqlite::Result<RunRow> {
    let config: String = row.get(8)?;
    let output: Option<String> = row.get(10)?;

    Ok(RunRow {
        run_id: row.get(0)?,
        task_id: row.get(1)?,
        set_id: row.get(2)?,
        run_type: row.get(3)?,
        scheduled_time: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        last_active: row.get(7)?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        status: row.get(9)?,
        output: output.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

const RUN_COLUMNS: &str = "run_id, task_id, set_id, run_type, scheduled_time, start_time, \
                           end_time, last_active, config, status, output";

/// Insert or replace a run row.
pub fn upsert(conn: &Connection, run: &RunRow) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO runs
            (run_id, task_id, set_id, run_type, scheduled_time, start_time,
             end_time, last_active, config, status, output)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            run.run_id,
            run.task_id,
            run.set_id,
            run.run_type,
            run.scheduled_time,
            run.start_time,
            run.end_time,
            run.last_active,
            run.config.to_string(),
            run.status,
            run.output.as_ref().map(|output| output.to_string()),
        ],
    )
    .context("Failed to upsert run")?;

    Ok(())
}

/// Load a run row by id.
pub fn get(conn: &Connection, run_id: &str) -> Result<Option<RunRow>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
    conn.query_row(&sql, params![run_id], |row| row_to_run(row))
        .optional()
        .context("Failed to query run")
}

/// Runs for a task scheduled at or after `since`, with optional filters.
pub fn get_all(
    conn: &Connection,
    task_id: &str,
    since: i64,
    set_id: Option<&str>,
    run_type: Option<&str>,
) -> Result<Vec<RunRow>> {
    let mut sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ?1 AND scheduled_time >= ?2"
    );
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
        vec![Box::new(task_id.to_string()), Box::new(since)];

    if let Some(set_id) = set_id {
        sql.push_str(&format!(" AND set_id = ?{}", bindings.len() + 1));
        bindings.push(Box::new(set_id.to_string()));
    }
    if let Some(run_type) = run_type {
        sql.push_str(&format!(" AND run_type = ?{}", bindings.len() + 1));
        bindings.push(Box::new(run_type.to_string()));
    }

    query_runs(conn, &sql, &bindings)
}

/// Runs for a task in the given status, optionally scoped to a schedule set.
pub fn get_by_status(
    conn: &Connection,
    task_id: &str,
    status: &str,
    set_id: Option<&str>,
) -> Result<Vec<RunRow>> {
    let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ?1 AND status = ?2");
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
        vec![Box::new(task_id.to_string()), Box::new(status.to_string())];

    if let Some(set_id) = set_id {
        sql.push_str(" AND set_id = ?3");
        bindings.push(Box::new(set_id.to_string()));
    }

    query_runs(conn, &sql, &bindings)
}

fn query_runs(
    conn: &Connection,
    sql: &str,
    bindings: &[Box<dyn rusqlite::ToSql>],
) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(sql).context("Failed to prepare run query")?;

    let params: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| row_to_run(row))
        .context("Failed to query runs")?;

    let mut runs = Vec::new();
    for row in rows {
        runs.push(row.context("Failed to read run row")?);
    }
    Ok(runs)
}

/// Refresh `last_active` on a run without touching any other column.
///
/// Heartbeats run concurrently with status writers; a whole-row write here
/// could clobber a transition committed in between.
pub fn update_last_active(conn: &Connection, run_id: &str, last_active: i64) -> Result<()> {
    conn.execute(
        "UPDATE runs SET last_active = ?1 WHERE run_id = ?2",
        params![last_active, run_id],
    )
    .context("Failed to update run last_active")?;

    Ok(())
}

/// Delete runs for a task scheduled before the cutoff; returns the count.
pub fn delete_before(conn: &Connection, task_id: &str, cutoff: i64) -> Result<usize> {
    let deleted = conn
        .execute(
            "DELETE FROM runs WHERE task_id = ?1 AND scheduled_time < ?2",
            params![task_id, cutoff],
        )
        .context("Failed to prune runs")?;

    Ok(deleted)
}

/// Delete one run row.
pub fn delete(conn: &Connection, run_id: &str) -> Result<()> {
    conn.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])
        .context("Failed to delete run")?;

    Ok(())
}
