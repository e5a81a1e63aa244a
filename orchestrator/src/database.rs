//! Database management for the orchestrator
//!
//! This module handles SQLite operations for the three durable tables the
//! orchestrator owns: task versions, runs and log entries. Task and run
//! rows are the serialization point for the whole system; every status
//! writer performs a read-modify-write against them.
// The store must be initialized before use. Operations on an uninitialized
// store fail with a distinct NotInitialised error rather than a generic
// database error, because the two demand different operator responses.

// Table-specific database modules
mod db_logs;
mod db_runs;
mod db_tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::config::StoreConfig;
use shared::OrchestratorError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

pub use db_logs::LogEntry;
pub use db_runs::RunRow;
pub use db_tasks::TaskRow;

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "orchestrator.db";

/// SQLite database manager for tasks, runs and logs.
/// The `connection` field is an `Option<Connection>` to allow for lazy
/// initialization of the connection.
pub struct Store {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
    /// Set once `initialize()` has created the schema
    initialised: bool,
}

impl Store {
    /// Create a new store manager for the configured data directory.
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
            initialised: false,
        })
    }

    /// Initialize the store by creating the necessary tables and indexes.
    /// Idempotent; safe to call on every process startup. All other
    /// operations fail with `NotInitialised` until this has run.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing orchestrator store at {}", self.db_path.display());

        let conn = self.open_connection()?;
        db_tasks::create_tables(conn)?;
        db_runs::create_tables(conn)?;
        db_logs::create_tables(conn)?;

        self.initialised = true;
        info!("Orchestrator store initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection without
    /// checking initialization. Only `initialize()` uses this directly.
    fn open_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode keeps scheduler reads running while a worker commits
            // a run transition.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.busy_timeout(Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// Gets the connection, refusing if the schema has not been created.
    fn get_connection(&mut self) -> Result<&mut Connection> {
        if !self.initialised {
            return Err(OrchestratorError::NotInitialised(
                "store used before initialize(); call Runtime::initialise first".to_string(),
            )
            .into());
        }
        self.open_connection()
    }

    // Task operations

    /// Insert or replace one task version row.
    pub async fn upsert_task(&mut self, task: &TaskRow) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::upsert(conn, task)
    }

    /// Latest version row for a task id, if any.
    pub async fn get_latest_task(&mut self, task_id: &str) -> Result<Option<TaskRow>> {
        let conn = self.get_connection()?;
        db_tasks::get_latest(conn, task_id)
    }

    /// Latest version row for every task id.
    pub async fn get_all_latest_tasks(&mut self) -> Result<Vec<TaskRow>> {
        let conn = self.get_connection()?;
        db_tasks::get_all_latest(conn)
    }

    /// Refresh `last_active` on an existing task version.
    pub async fn update_task_last_active(
        &mut self,
        task_id: &str,
        version: i64,
        last_active: i64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::update_last_active(conn, task_id, version, last_active)
    }

    // Run operations

    /// Insert or replace a run row.
    pub async fn upsert_run(&mut self, run: &RunRow) -> Result<()> {
        let conn = self.get_connection()?;
        db_runs::upsert(conn, run)
    }

    /// Load a run row by id.
    pub async fn get_run(&mut self, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.get_connection()?;
        db_runs::get(conn, run_id)
    }

    /// Runs for a task scheduled at or after `since`, optionally filtered
    /// by schedule set and run type.
    pub async fn get_runs(
        &mut self,
        task_id: &str,
        since: i64,
        set_id: Option<&str>,
        run_type: Option<&str>,
    ) -> Result<Vec<RunRow>> {
        let conn = self.get_connection()?;
        db_runs::get_all(conn, task_id, since, set_id, run_type)
    }

    /// Runs for a task in a given status, optionally filtered by schedule set.
    pub async fn get_runs_by_status(
        &mut self,
        task_id: &str,
        status: &str,
        set_id: Option<&str>,
    ) -> Result<Vec<RunRow>> {
        let conn = self.get_connection()?;
        db_runs::get_by_status(conn, task_id, status, set_id)
    }

    /// Refresh `last_active` on a run row.
    pub async fn update_run_last_active(&mut self, run_id: &str, last_active: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_runs::update_last_active(conn, run_id, last_active)
    }

    /// Delete runs for a task scheduled before the cutoff; returns the
    /// number of rows deleted.
    pub async fn delete_runs_before(&mut self, task_id: &str, cutoff: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        let deleted = db_runs::delete_before(conn, task_id, cutoff)?;
        debug!("Pruned {} runs for task {}", deleted, task_id);
        Ok(deleted)
    }

    /// Delete a single run row.
    pub async fn delete_run(&mut self, run_id: &str) -> Result<()> {
        let conn = self.get_connection()?;
        db_runs::delete(conn, run_id)
    }

    // Log operations

    /// Append a log entry. Entries are never updated.
    pub async fn add_log_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let conn = self.get_connection()?;
        db_logs::add(conn, entry)
    }

    /// Delete log entries created before the cutoff; returns the number
    /// of rows deleted.
    pub async fn prune_logs(&mut self, cutoff: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_logs::prune(conn, cutoff)
    }

    /// Fetch log entries, optionally restricted to one source, oldest first.
    pub async fn get_log_entries(&mut self, source: Option<&str>) -> Result<Vec<LogEntry>> {
        let conn = self.get_connection()?;
        db_logs::get_entries(conn, source)
    }
}
