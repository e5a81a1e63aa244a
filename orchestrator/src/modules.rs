//! Module invocation with retries and timing telemetry
//!
//! A module is any effectful operation a task function performs: reading a
//! source, writing a sink, running a transform. Every invocation goes
//! through [`invoke`], which retries on failure and records one timing
//! entry per attempt into the run's context. The heartbeat periodically
//! lifts those entries into the run's durable output, so
//! `output.run_times` is the authoritative per-module execution trace —
//! without the task function threading anything through by hand.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::config::ModuleConfig;
use shared::OrchestratorError;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// What a module does; purely descriptive, used for telemetry and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Reads data from somewhere
    Source,
    /// Writes data somewhere
    Sink,
    /// Reshapes data in memory
    Transform,
}

/// Descriptor for a module operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub module_id: String,
    pub description: String,
    pub kind: ModuleKind,
}

impl Module {
    pub fn new(module_id: &str, description: &str, kind: ModuleKind) -> Self {
        Self {
            module_id: module_id.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}

/// One timing record per module attempt.
///
/// For an operation that succeeds after k retries, k+1 records exist with
/// `retry_count` values 0 through k; `retry_exceptions` carries the
/// errors from the attempts before this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRunTime {
    pub module_id: String,
    pub start_time_posix: f64,
    pub end_time_posix: f64,
    pub duration_seconds: f64,
    pub retry_count: u32,
    pub retry_exceptions: Vec<String>,
}

/// Per-run shared state between the task function, the module wrapper,
/// the heartbeat and the timeout waiter.
///
/// Replaces thread-name-keyed globals with an explicit object: telemetry
/// written here by a module is observable by the heartbeat for the same
/// run, and the timeout budget can be expired from the heartbeat to force
/// an abort on cancellation.
pub struct RunContext {
    run_id: String,
    run_times: Mutex<Vec<ModuleRunTime>>,
    /// Remaining timeout budget in seconds; the waiter decrements it and
    /// aborts the execution when it reaches zero
    timeout_remaining: AtomicI64,
}

impl RunContext {
    pub fn new(run_id: &str, timeout_seconds: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_times: Mutex::new(Vec::new()),
            timeout_remaining: AtomicI64::new(timeout_seconds),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one timing record.
    pub fn record(&self, entry: ModuleRunTime) {
        self.run_times
            .lock()
            .expect("run times lock poisoned")
            .push(entry);
    }

    /// Snapshot of the timing records accumulated so far.
    pub fn run_times(&self) -> Vec<ModuleRunTime> {
        self.run_times
            .lock()
            .expect("run times lock poisoned")
            .clone()
    }

    /// Clear records at the start of a run.
    pub fn clear_run_times(&self) {
        self.run_times
            .lock()
            .expect("run times lock poisoned")
            .clear();
    }

    /// Decrement the timeout budget; returns the remaining seconds.
    pub fn tick_down(&self, seconds: i64) -> i64 {
        self.timeout_remaining.fetch_sub(seconds, Ordering::SeqCst) - seconds
    }

    /// Expire the timeout budget, forcing the waiter to abort the run.
    /// Used by the heartbeat when it observes a cancellation.
    pub fn expire_timeout(&self) {
        self.timeout_remaining.store(0, Ordering::SeqCst);
    }

    pub fn timeout_remaining(&self) -> i64 {
        self.timeout_remaining.load(Ordering::SeqCst)
    }
}

/// Run a module operation with retries, recording one timing entry per
/// attempt into the context.
///
/// Retries up to `config.max_retries` times after the first failure,
/// sleeping `config.retry_interval_seconds` between attempts. The final
/// failure composes an error naming the module and the total attempt
/// count.
pub async fn invoke<T, F, Fut>(
    context: &RunContext,
    module: &Module,
    config: &ModuleConfig,
    operation: F,
) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut retry_count: u32 = 0;
    let mut retry_exceptions: Vec<String> = Vec::new();

    loop {
        let started = Utc::now();
        let result = operation().await;
        let ended = Utc::now();

        context.record(ModuleRunTime {
            module_id: module.module_id.clone(),
            start_time_posix: started.timestamp_millis() as f64 / 1000.0,
            end_time_posix: ended.timestamp_millis() as f64 / 1000.0,
            duration_seconds: (ended - started).num_milliseconds() as f64 / 1000.0,
            retry_count,
            retry_exceptions: retry_exceptions.clone(),
        });

        match result {
            Ok(value) => {
                debug!(
                    "Module '{}' completed on attempt {} for run {}",
                    module.module_id,
                    retry_count + 1,
                    context.run_id
                );
                return Ok(value);
            }
            Err(e) => {
                let total_attempts = retry_count + 1;
                retry_exceptions.push(format!("{e:#}"));

                if total_attempts > config.max_retries {
                    return Err(OrchestratorError::Module(format!(
                        "Module '{}' failed: {:#} (total attempts: {})",
                        module.module_id, e, total_attempts
                    ))
                    .into());
                }

                warn!(
                    "Module '{}' attempt {} failed for run {}, retrying in {}s: {:#}",
                    module.module_id, total_attempts, context.run_id, config.retry_interval_seconds, e
                );
                retry_count = total_attempts;
                tokio::time::sleep(Duration::from_secs(config.retry_interval_seconds)).await;
            }
        }
    }
}
