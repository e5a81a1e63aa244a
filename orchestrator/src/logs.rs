//! Durable event log
//!
//! A `LogManager` is a cheap per-subsystem handle onto the shared
//! `log_entries` table. Entries are structured (category, text, JSON
//! payload) and pruned by age from the scheduler's prune loop. This is the
//! durable audit trail; process-level diagnostics go through `tracing`.

use serde_json::Value;
use shared::utils::now_seconds;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::{LogEntry, Store};

/// Append-only structured log writer for one source.
#[derive(Clone)]
pub struct LogManager {
    store: Arc<Mutex<Store>>,
    source: String,
}

impl LogManager {
    pub fn new(store: Arc<Mutex<Store>>, source: &str) -> Self {
        Self {
            store,
            source: source.to_string(),
        }
    }

    /// Append one entry for this manager's source.
    pub async fn add_entry(&self, category: &str, text: &str, json: Value) -> shared::Result<()> {
        let entry = LogEntry {
            entry_id: Uuid::new_v4().to_string(),
            entry_created: now_seconds(),
            entry_source: self.source.clone(),
            entry_category: category.to_string(),
            entry_text: text.to_string(),
            entry_json: json,
        };

        self.store.lock().await.add_log_entry(&entry).await
    }

    /// Delete entries older than `max_age`; returns the number deleted.
    pub async fn prune(&self, max_age: Duration) -> shared::Result<usize> {
        let cutoff = now_seconds() - max_age.as_secs() as i64;
        self.store.lock().await.prune_logs(cutoff).await
    }

    /// Fetch entries for this manager's source, oldest first.
    pub async fn get_entries(&self) -> shared::Result<Vec<LogEntry>> {
        self.store
            .lock()
            .await
            .get_log_entries(Some(&self.source))
            .await
    }
}
