//! Run model and lifecycle state machine
//!
//! A run is a single execution attempt of a task at a particular scheduled
//! time. Its status moves through a strict state machine:
//!
//! ```text
//! queued -> running -> {success, warn, failed, cancelled}
//!                      warn -> {failed, cancelled}
//! ```
//!
//! `failed` and `cancelled` are terminal; `warn` can be upgraded to
//! `failed` but never back to `success`. Every status writer re-reads the
//! stored row, checks the transition predicate against it, merges the
//! supplied output over the stored output (supplied keys win) and writes.
//! Reaching `failed` publishes a `run_failed` message after the write.

use anyhow::anyhow;
use serde_json::{json, Value};
use shared::utils::{merge_output, now_seconds};
use shared::OrchestratorError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::{RunFailedMessage, RUN_FAILED};
use crate::database::RunRow;
use crate::runtime::Runtime;
use crate::tasks::{ScheduleSet, TaskItem};

/// The status of a run instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Warn,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Warn => "warn",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> shared::Result<Self> {
        match value {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "warn" => Ok(RunStatus::Warn),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow!("Invalid run status: {}", other)),
        }
    }
}

/// The kinds of runs that can be created.
/// - `Scheduled`: created by the scheduler at a cron tick
/// - `Manual`: created by hand as a one-off
/// - `Retry`: created as a retry of a failed run
/// - `Triggered`: created on successful completion of another task's run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Scheduled,
    Manual,
    Retry,
    Triggered,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
            RunType::Retry => "retry",
            RunType::Triggered => "triggered",
        }
    }

    pub fn parse(value: &str) -> shared::Result<Self> {
        match value {
            "scheduled" => Ok(RunType::Scheduled),
            "manual" => Ok(RunType::Manual),
            "retry" => Ok(RunType::Retry),
            "triggered" => Ok(RunType::Triggered),
            other => Err(anyhow!("Invalid run type: {}", other)),
        }
    }
}

/// A run as loaded from (or about to be written to) the store.
///
/// Instantiating this type does not create a run; use [`RunItem::create`].
/// Instances are snapshots: `reload` refreshes them from the store.
#[derive(Clone)]
pub struct RunItem {
    runtime: Arc<Runtime>,
    pub run_id: String,
    pub task_id: String,
    pub set_id: String,
    pub run_type: RunType,
    /// The cron tick this run represents, unix seconds
    pub scheduled_time: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub last_active: Option<i64>,
    /// Snapshot of the schedule set config at creation
    pub config: Value,
    pub status: RunStatus,
    /// Free-form output merged across status writes
    pub output: Option<Value>,
}

impl fmt::Debug for RunItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunItem")
            .field("run_id", &self.run_id)
            .field("task_id", &self.task_id)
            .field("set_id", &self.set_id)
            .field("run_type", &self.run_type)
            .field("scheduled_time", &self.scheduled_time)
            .field("status", &self.status)
            .field("output", &self.output)
            .finish()
    }
}

impl RunItem {
    fn from_row(runtime: Arc<Runtime>, row: RunRow) -> shared::Result<Self> {
        Ok(Self {
            runtime,
            run_id: row.run_id,
            task_id: row.task_id,
            set_id: row.set_id,
            run_type: RunType::parse(&row.run_type)?,
            scheduled_time: row.scheduled_time,
            start_time: row.start_time,
            end_time: row.end_time,
            last_active: row.last_active,
            config: row.config,
            status: RunStatus::parse(&row.status)?,
            output: row.output,
        })
    }

    fn to_row(&self) -> RunRow {
        RunRow {
            run_id: self.run_id.clone(),
            task_id: self.task_id.clone(),
            set_id: self.set_id.clone(),
            run_type: self.run_type.as_str().to_string(),
            scheduled_time: self.scheduled_time,
            start_time: self.start_time,
            end_time: self.end_time,
            last_active: self.last_active,
            config: self.config.clone(),
            status: self.status.as_str().to_string(),
            output: self.output.clone(),
        }
    }

    /// Create a new queued run for a task and schedule set.
    pub async fn create(
        task: &TaskItem,
        run_type: RunType,
        schedule: &ScheduleSet,
        scheduled_time: i64,
    ) -> shared::Result<RunItem> {
        let set_id = schedule.require_set_id()?.to_string();
        let runtime = Arc::clone(task.runtime());

        let run = RunItem {
            runtime,
            run_id: Uuid::new_v4().to_string(),
            task_id: task.task_id.clone(),
            set_id,
            run_type,
            scheduled_time,
            start_time: None,
            end_time: None,
            last_active: None,
            config: schedule.config.clone(),
            status: RunStatus::Queued,
            output: None,
        };

        run.runtime.store().lock().await.upsert_run(&run.to_row()).await?;
        debug!(
            "Created {} run {} for task '{}'",
            run.run_type.as_str(),
            run.run_id,
            run.task_id
        );
        Ok(run)
    }

    /// Load any run by id.
    pub async fn get(runtime: &Arc<Runtime>, run_id: &str) -> shared::Result<Option<RunItem>> {
        let row = runtime.store().lock().await.get_run(run_id).await?;
        row.map(|row| RunItem::from_row(Arc::clone(runtime), row))
            .transpose()
    }

    /// All runs for a task scheduled at or after `since` (unix seconds),
    /// optionally filtered by schedule set and run type.
    pub async fn get_all(
        task: &TaskItem,
        since: i64,
        schedule: Option<&ScheduleSet>,
        run_type: Option<RunType>,
    ) -> shared::Result<Vec<RunItem>> {
        let set_id = match schedule {
            Some(schedule) => {
                let set_id = schedule.require_set_id()?;
                // Guard against passing a schedule from a different task.
                if task.get_schedule_set(set_id).is_none() {
                    return Err(anyhow!(
                        "Schedule set '{}' not found for task '{}'",
                        set_id,
                        task.task_id
                    ));
                }
                Some(set_id.to_string())
            }
            None => None,
        };

        let rows = task
            .runtime()
            .store()
            .lock()
            .await
            .get_runs(
                &task.task_id,
                since,
                set_id.as_deref(),
                run_type.map(|t| t.as_str()),
            )
            .await?;

        rows.into_iter()
            .map(|row| RunItem::from_row(Arc::clone(task.runtime()), row))
            .collect()
    }

    /// Queued runs for a task, optionally scoped to one schedule set.
    pub async fn get_all_queued(
        task: &TaskItem,
        schedule: Option<&ScheduleSet>,
    ) -> shared::Result<Vec<RunItem>> {
        Self::get_by_status(task, schedule, RunStatus::Queued).await
    }

    /// Running runs for a task, optionally scoped to one schedule set.
    pub async fn get_running_runs(
        task: &TaskItem,
        schedule: Option<&ScheduleSet>,
    ) -> shared::Result<Vec<RunItem>> {
        Self::get_by_status(task, schedule, RunStatus::Running).await
    }

    async fn get_by_status(
        task: &TaskItem,
        schedule: Option<&ScheduleSet>,
        status: RunStatus,
    ) -> shared::Result<Vec<RunItem>> {
        let set_id = schedule.map(|s| s.require_set_id()).transpose()?;
        let rows = task
            .runtime()
            .store()
            .lock()
            .await
            .get_runs_by_status(&task.task_id, status.as_str(), set_id)
            .await?;

        rows.into_iter()
            .map(|row| RunItem::from_row(Arc::clone(task.runtime()), row))
            .collect()
    }

    /// Latest run for a task by scheduled time, optionally scoped to one
    /// schedule set and run type.
    ///
    /// With a schedule the query is bounded to the last two inter-tick
    /// intervals, which keeps it independent of history size; if that
    /// window is empty (e.g. right after a runner restart), it falls back
    /// to an unbounded scan.
    pub async fn get_latest(
        task: &TaskItem,
        schedule: Option<&ScheduleSet>,
        run_type: Option<RunType>,
    ) -> shared::Result<Option<RunItem>> {
        let mut runs = match schedule {
            Some(schedule) => {
                let last_tick = task.get_last_scheduled(schedule)?;
                let interval = task.get_time_between_runs(schedule)?;
                let since = (last_tick - interval * 2).timestamp();
                Self::get_all(task, since, Some(schedule), run_type).await?
            }
            None => Vec::new(),
        };

        if runs.is_empty() {
            runs = Self::get_all(task, 0, schedule, None).await?;
            if let Some(run_type) = run_type {
                runs.retain(|run| run.run_type == run_type);
            }
        }

        runs.sort_by(|a, b| b.scheduled_time.cmp(&a.scheduled_time));
        Ok(runs.into_iter().next())
    }

    /// Replace in-memory fields from the store.
    pub async fn reload(&mut self) -> shared::Result<()> {
        let fresh = RunItem::get(&self.runtime, &self.run_id)
            .await?
            .ok_or_else(|| anyhow!("Run {} not found in store", self.run_id))?;
        *self = fresh;
        Ok(())
    }

    /// Delete this run's row. The instance itself is untouched.
    pub async fn delete(&self) -> shared::Result<()> {
        self.runtime.store().lock().await.delete_run(&self.run_id).await
    }

    /// Refresh the liveness heartbeat on this run.
    pub async fn update_active(&mut self) -> shared::Result<()> {
        let last_active = now_seconds();
        self.last_active = Some(last_active);
        self.runtime
            .store()
            .lock()
            .await
            .update_run_last_active(&self.run_id, last_active)
            .await
    }

    /// Write status, times and output, skipping the write when nothing
    /// differs from the stored row (avoids no-op versions in the database
    /// log).
    pub async fn update(
        &mut self,
        status: RunStatus,
        start_time: Option<i64>,
        end_time: Option<i64>,
        output: Option<Value>,
    ) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;

        if let Some(stored) = &stored {
            // Carry forward fields this writer does not own.
            self.last_active = stored.last_active;
        }

        self.status = status;
        self.start_time = start_time;
        self.end_time = end_time;
        self.output = output;

        let needs_update = match &stored {
            None => true,
            Some(stored) => {
                stored.status != self.status
                    || stored.start_time != self.start_time
                    || stored.end_time != self.end_time
                    || stored.output != self.output
            }
        };

        if needs_update {
            self.runtime
                .store()
                .lock()
                .await
                .upsert_run(&self.to_row())
                .await?;
        }
        Ok(())
    }

    /// Transition `queued -> running` and set the start time.
    ///
    /// Idempotent when already running; refuses from any other state.
    pub async fn set_running(&mut self, output: Option<Value>) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;
        let mut new_output = output;
        if let Some(stored) = &stored {
            if stored.status == RunStatus::Running {
                return Ok(());
            }
            if stored.status != RunStatus::Queued {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "Run {} is {}, cannot set to running",
                    self.run_id,
                    stored.status.as_str()
                ))
                .into());
            }
            new_output = merge_output(stored.output.clone(), new_output);
        }

        self.update(RunStatus::Running, Some(now_seconds()), None, new_output)
            .await
    }

    /// Finalize as `success` and set the end time.
    ///
    /// Refuses on `failed` and `warn` so a failure can never be papered
    /// over; idempotent when already successful.
    pub async fn set_success(&mut self, output: Option<Value>) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;
        let mut new_output = output;
        let mut start_time = self.start_time;
        if let Some(stored) = &stored {
            match stored.status {
                RunStatus::Failed => {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Run {} is failed, cannot set to success",
                        self.run_id
                    ))
                    .into());
                }
                RunStatus::Warn => {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Run {} is warn, cannot set to success",
                        self.run_id
                    ))
                    .into());
                }
                RunStatus::Success => return Ok(()),
                _ => {}
            }
            new_output = merge_output(stored.output.clone(), new_output);
            start_time = stored.start_time;
        }

        self.update(RunStatus::Success, start_time, Some(now_seconds()), new_output)
            .await
    }

    /// Finalize as `warn` and set the end time.
    ///
    /// Refuses on `failed`; idempotent when already warned. A warned run
    /// can still be upgraded to `failed`, never back to `success`.
    pub async fn set_warn(&mut self, output: Option<Value>) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;
        let mut new_output = output;
        let mut start_time = self.start_time;
        if let Some(stored) = &stored {
            match stored.status {
                RunStatus::Failed => {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "Run {} is failed, cannot set to warn",
                        self.run_id
                    ))
                    .into());
                }
                RunStatus::Warn => return Ok(()),
                _ => {}
            }
            new_output = merge_output(stored.output.clone(), new_output);
            start_time = stored.start_time;
        }

        self.update(RunStatus::Warn, start_time, Some(now_seconds()), new_output)
            .await
    }

    /// Finalize as `failed`, set the end time and publish `run_failed`.
    ///
    /// Idempotent when already failed; a quiet no-op on cancelled runs.
    /// `zero_duration` sets the end time equal to the start time, used for
    /// historical runs whose true end is unknown. The message is published
    /// only after the row write commits, so consumers always find the
    /// failed row.
    pub async fn set_failed(
        &mut self,
        output: Option<Value>,
        zero_duration: bool,
    ) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;
        let mut new_output = output;
        let mut start_time = self.start_time;
        if let Some(stored) = &stored {
            match stored.status {
                RunStatus::Cancelled => return Ok(()),
                RunStatus::Failed => return Ok(()),
                _ => {}
            }
            new_output = merge_output(stored.output.clone(), new_output);
            start_time = stored.start_time;
        }

        let end_time = if zero_duration {
            start_time
        } else {
            Some(now_seconds())
        };

        self.update(RunStatus::Failed, start_time, end_time, new_output)
            .await?;
        self.publish_run_failed().await;
        Ok(())
    }

    /// Finalize as `cancelled` and set the end time. Idempotent; permitted
    /// from every state.
    pub async fn set_cancelled(
        &mut self,
        output: Option<Value>,
        zero_duration: bool,
    ) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id).await?;
        let mut new_output = output;
        let mut start_time = self.start_time;
        if let Some(stored) = &stored {
            if stored.status == RunStatus::Cancelled {
                return Ok(());
            }
            new_output = merge_output(stored.output.clone(), new_output);
            start_time = stored.start_time;
        }

        let end_time = if zero_duration {
            start_time
        } else {
            Some(now_seconds())
        };

        self.update(RunStatus::Cancelled, start_time, end_time, new_output)
            .await
    }

    /// Write the run's output without touching status or times.
    ///
    /// With `merge` the supplied keys are merged over the stored output;
    /// without it the stored output is replaced wholesale.
    pub async fn set_output(&mut self, output: Option<Value>, merge: bool) -> shared::Result<()> {
        let stored = RunItem::get(&self.runtime, &self.run_id)
            .await?
            .ok_or_else(|| anyhow!("set_output failed, run {} not found", self.run_id))?;

        let new_output = if merge {
            merge_output(stored.output.clone(), output)
        } else {
            output
        };

        self.update(stored.status, stored.start_time, stored.end_time, new_output)
            .await
    }

    /// Publish `run_failed` for this run, falling back to the durable log
    /// when no broker producer is configured. Failures here never unwind
    /// the state transition that triggered them.
    async fn publish_run_failed(&self) {
        let message = RunFailedMessage {
            task_id: self.task_id.clone(),
            run_id: self.run_id.clone(),
        };

        match self.runtime.producer() {
            Some(producer) => match producer.send_message(&RUN_FAILED, &message).await {
                Ok(status) => {
                    debug!("Published run_failed for {}: {}", self.run_id, status);
                }
                Err(e) => {
                    warn!("Failed to publish run_failed for {}: {:#}", self.run_id, e);
                    let _ = self
                        .runtime
                        .logs("tasks")
                        .add_entry(
                            "mqueue",
                            "failed to publish run_failed",
                            json!({
                                "task_id": message.task_id,
                                "run_id": message.run_id,
                                "error": format!("{e:#}"),
                            }),
                        )
                        .await;
                }
            },
            None => {
                let _ = self
                    .runtime
                    .logs("tasks")
                    .add_entry(
                        "mqueue",
                        "run failed with no broker configured",
                        json!({
                            "task_id": message.task_id,
                            "run_id": message.run_id,
                        }),
                    )
                    .await;
            }
        }
    }
}
