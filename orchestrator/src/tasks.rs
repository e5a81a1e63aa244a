//! Task model
//!
//! A task is a durable, identifiable unit of work with one or more cron
//! schedules. Tasks are versioned append-only: identity-shaping changes
//! (name, schedules, thread group, metadata, tags) and status toggles write
//! a new version row; liveness heartbeats update the current version in
//! place. Only the latest version of a task is authoritative.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::utils::{now_millis, now_seconds};
use shared::OrchestratorError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::monitors::TaskMonitor;
use crate::runner::RunHandle;
use crate::runs::{RunItem, RunType};
use crate::runtime::Runtime;

/// The lifecycle states of a task. Only `enabled` tasks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Enabled,
    /// Explicitly disabled by an operator; never auto re-enabled
    Disabled,
    /// Disabled by the scheduler for staleness; reactivated by the next
    /// liveness heartbeat
    Inactive,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Enabled => "enabled",
            TaskStatus::Disabled => "disabled",
            TaskStatus::Inactive => "inactive",
            TaskStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> shared::Result<Self> {
        match value {
            "enabled" => Ok(TaskStatus::Enabled),
            "disabled" => Ok(TaskStatus::Disabled),
            "inactive" => Ok(TaskStatus::Inactive),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(anyhow!("Invalid task status: {}", other)),
        }
    }
}

/// Reference to the task (and optionally one of its schedule sets) whose
/// `triggered` run is created when a run of the owning schedule succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerTask {
    pub task_id: String,
    /// None means the trigger target's first schedule set
    pub set_id: Option<String>,
}

/// A `(cron, config, optional trigger)` triple attached to a task.
///
/// `set_id` is derived as `{task_id}_{cron}` when the set is attached to a
/// task, which allows the same cron expression on different tasks while
/// keeping ids unique within one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSet {
    /// Unset until the schedule set is attached to a task
    pub set_id: Option<String>,
    /// Standard 5-field cron expression
    pub cron_schedule: String,
    /// Opaque per-run configuration passed to the task function
    pub config: Value,
    pub trigger_task: Option<TriggerTask>,
}

impl ScheduleSet {
    pub fn new(cron_schedule: &str, config: Value) -> Self {
        Self {
            set_id: None,
            cron_schedule: cron_schedule.to_string(),
            config,
            trigger_task: None,
        }
    }

    pub fn with_trigger(cron_schedule: &str, config: Value, trigger_task: TriggerTask) -> Self {
        Self {
            set_id: None,
            cron_schedule: cron_schedule.to_string(),
            config,
            trigger_task: Some(trigger_task),
        }
    }

    /// The set id, which must have been assigned by task creation.
    pub fn require_set_id(&self) -> shared::Result<&str> {
        self.set_id
            .as_deref()
            .ok_or_else(|| anyhow!("Schedule set id not set; attach the set to a task first"))
    }
}

/// Parse a 5-field cron expression.
///
/// The cron crate wants a seconds field, so a `0` is prepended; schedule
/// resolution stays at one minute.
pub fn parse_cron(expression: &str) -> shared::Result<Schedule> {
    let normalized = format!("0 {}", expression.trim());
    Schedule::from_str(&normalized)
        .map_err(|e| anyhow!("Invalid cron expression '{}': {}", expression, e))
}

/// The next cron tick strictly after `now`.
pub fn next_tick(expression: &str, now: DateTime<Utc>) -> shared::Result<DateTime<Utc>> {
    let schedule = parse_cron(expression)?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| anyhow!("No future occurrence for cron expression '{}'", expression))
}

/// The time between two consecutive ticks, measured from `now`.
pub fn tick_interval(expression: &str, now: DateTime<Utc>) -> shared::Result<ChronoDuration> {
    let schedule = parse_cron(expression)?;
    let mut upcoming = schedule.after(&now);
    let first = upcoming
        .next()
        .ok_or_else(|| anyhow!("No future occurrence for cron expression '{}'", expression))?;
    let second = upcoming
        .next()
        .ok_or_else(|| anyhow!("No future occurrence for cron expression '{}'", expression))?;
    Ok(second - first)
}

/// The most recent cron tick strictly before `now`.
///
/// The cron crate only iterates forward, so this probes backwards in
/// doubling windows and walks each window forward to the last tick before
/// `now`. Sparse schedules (e.g. yearly) resolve within a few probes.
pub fn previous_tick(expression: &str, now: DateTime<Utc>) -> shared::Result<DateTime<Utc>> {
    let schedule = parse_cron(expression)?;
    let mut lookback = tick_interval(expression, now)?.max(ChronoDuration::minutes(1)) * 2;
    let limit = ChronoDuration::days(4 * 366);

    loop {
        let probe = now - lookback;
        let mut last = None;
        for tick in schedule.after(&probe) {
            if tick >= now {
                break;
            }
            last = Some(tick);
        }
        if let Some(tick) = last {
            return Ok(tick);
        }
        if lookback > limit {
            return Err(anyhow!(
                "No past occurrence within four years for cron expression '{}'",
                expression
            ));
        }
        lookback = lookback * 2;
    }
}

/// The function executed for each run of a task.
///
/// Receives the owning task, a handle to the live run (for status and
/// output writes and module invocation) and the run's config snapshot.
pub type TaskFunction =
    Arc<dyn Fn(TaskItem, RunHandle, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Parameters for [`TaskItem::create`].
pub struct NewTask {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub schedule_sets: Vec<ScheduleSet>,
    pub task_function: TaskFunction,
    /// Worker loop that owns this task; tasks sharing a group run serially
    pub thread_group: String,
    /// Opaque structured data, e.g. for UI workspaces
    pub metadata: Value,
    /// Free-form labels for grouping and filtering
    pub tags: Vec<String>,
    /// Register with the in-process runner so a restarted process rebinds
    /// its handlers to the durable task set
    pub register_with_runner: bool,
    pub monitors: Vec<Arc<dyn TaskMonitor>>,
}

impl NewTask {
    pub fn new(
        task_id: &str,
        name: &str,
        description: &str,
        schedule_sets: Vec<ScheduleSet>,
        task_function: TaskFunction,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            schedule_sets,
            task_function,
            thread_group: crate::runner::BASE_THREAD_GROUP.to_string(),
            metadata: json!({}),
            tags: Vec::new(),
            register_with_runner: true,
            monitors: Vec::new(),
        }
    }
}

/// A task as loaded from (or about to be written to) the store.
///
/// Instances are snapshots; field reads do not reflect later store writes
/// until the task is re-fetched.
#[derive(Clone)]
pub struct TaskItem {
    runtime: Arc<Runtime>,
    pub task_id: String,
    /// Version timestamp, unix milliseconds
    pub version: i64,
    pub metadata: Value,
    pub tags: Vec<String>,
    pub name: String,
    pub description: String,
    pub schedule_sets: Vec<ScheduleSet>,
    pub thread_group: String,
    /// Most recent liveness heartbeat, unix seconds
    pub last_active: i64,
    pub status: TaskStatus,
    /// Annotation from the most recent status change
    pub notes: Option<String>,
    /// Present only on tasks registered in this process
    pub task_function: Option<TaskFunction>,
}

impl fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskItem")
            .field("task_id", &self.task_id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("thread_group", &self.thread_group)
            .field("last_active", &self.last_active)
            .field("status", &self.status)
            .field("schedule_sets", &self.schedule_sets)
            .finish()
    }
}

impl TaskItem {
    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn from_row(runtime: Arc<Runtime>, row: crate::database::TaskRow) -> shared::Result<Self> {
        let schedule_sets: Vec<ScheduleSet> = serde_json::from_value(row.schedule_sets)
            .context("Failed to decode schedule sets for task")?;
        let tags: Vec<String> =
            serde_json::from_value(row.tags).context("Failed to decode tags for task")?;

        Ok(Self {
            runtime,
            task_id: row.task_id,
            version: row.version,
            metadata: row.metadata,
            tags,
            name: row.name,
            description: row.description,
            schedule_sets,
            thread_group: row.thread_group,
            last_active: row.last_active,
            status: TaskStatus::parse(&row.status)?,
            notes: row.notes,
            task_function: None,
        })
    }

    pub(crate) fn to_row(&self) -> shared::Result<crate::database::TaskRow> {
        Ok(crate::database::TaskRow {
            task_id: self.task_id.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
            tags: serde_json::to_value(&self.tags)?,
            name: self.name.clone(),
            description: self.description.clone(),
            schedule_sets: serde_json::to_value(&self.schedule_sets)?,
            thread_group: self.thread_group.clone(),
            last_active: self.last_active,
            status: self.status.as_str().to_string(),
            notes: self.notes.clone(),
        })
    }

    /// Latest version of a task by id.
    pub async fn get(runtime: &Arc<Runtime>, task_id: &str) -> shared::Result<Option<TaskItem>> {
        let row = runtime
            .store()
            .lock()
            .await
            .get_latest_task(task_id)
            .await?;
        row.map(|row| TaskItem::from_row(Arc::clone(runtime), row))
            .transpose()
    }

    /// Latest version of every task.
    pub async fn get_all(runtime: &Arc<Runtime>) -> shared::Result<Vec<TaskItem>> {
        let rows = runtime.store().lock().await.get_all_latest_tasks().await?;
        rows.into_iter()
            .map(|row| TaskItem::from_row(Arc::clone(runtime), row))
            .collect()
    }

    /// Create (or refresh) a task.
    ///
    /// Idempotent: a new version is written only when an identity-shaping
    /// field differs from the latest stored version. Registration with the
    /// runner happens regardless, so a restarted process rebinds its
    /// in-memory task function to the durable task set. A task left
    /// `inactive` by the scheduler comes back `enabled`; an explicitly
    /// `disabled` task stays disabled.
    pub async fn create(runtime: &Arc<Runtime>, new_task: NewTask) -> shared::Result<TaskItem> {
        let version = now_millis();
        let current = TaskItem::get(runtime, &new_task.task_id).await?;

        // Assign set ids as task_id + cron so schedules are addressable.
        let mut schedule_sets = Vec::with_capacity(new_task.schedule_sets.len());
        for mut schedule in new_task.schedule_sets {
            parse_cron(&schedule.cron_schedule)?;
            schedule.set_id = Some(format!(
                "{}_{}",
                new_task.task_id, schedule.cron_schedule
            ));
            schedule_sets.push(schedule);
        }

        let update_needed = match &current {
            None => true,
            Some(current) => {
                current.metadata != new_task.metadata
                    || current.tags != new_task.tags
                    || current.name != new_task.name
                    || current.description != new_task.description
                    || current.schedule_sets != schedule_sets
                    || current.thread_group != new_task.thread_group
            }
        };

        // Only re-enable inactive tasks, not disabled ones.
        let status = match &current {
            None => TaskStatus::Enabled,
            Some(current) if current.status == TaskStatus::Inactive => TaskStatus::Enabled,
            Some(current) => current.status,
        };

        let mut task = TaskItem {
            runtime: Arc::clone(runtime),
            task_id: new_task.task_id,
            version,
            metadata: new_task.metadata,
            tags: new_task.tags,
            name: new_task.name,
            description: new_task.description,
            schedule_sets,
            thread_group: new_task.thread_group,
            last_active: version / 1000,
            status,
            notes: None,
            task_function: Some(new_task.task_function),
        };

        for monitor in &new_task.monitors {
            monitor.add_task(&task);
        }

        // Register before the update check so an unchanged task still gets
        // its in-memory function bound to this process's runner.
        if new_task.register_with_runner {
            runtime.register_with_runner(task.clone())?;
        }

        if !update_needed {
            if let Some(current) = current {
                task.version = current.version;
                task.last_active = current.last_active;
                return Ok(task);
            }
        }

        debug!("Writing task version {} for '{}'", version, task.task_id);
        let row = task.to_row()?;
        runtime.store().lock().await.upsert_task(&row).await?;
        Ok(task)
    }

    /// Write a new version with the given status.
    ///
    /// Used to enable/disable a task; disabling prevents the scheduler
    /// from queuing further runs.
    pub async fn set_status(&mut self, status: TaskStatus, notes: &str) -> shared::Result<()> {
        self.status = status;
        self.notes = Some(notes.to_string());
        // Toggling status creates a new version
        self.version = now_millis();
        let row = self.to_row()?;
        self.runtime.store().lock().await.upsert_task(&row).await
    }

    /// Enable the task unless it already is enabled.
    pub async fn set_enabled(&mut self, notes: &str) -> shared::Result<()> {
        if self.status == TaskStatus::Enabled {
            return Ok(());
        }
        self.set_status(TaskStatus::Enabled, notes).await
    }

    /// Refresh the liveness heartbeat on the current version.
    ///
    /// A task the scheduler parked as `inactive` is reactivated first:
    /// a heartbeat proves a worker owns it again.
    pub async fn update_active(&mut self) -> shared::Result<()> {
        if self.status == TaskStatus::Inactive {
            self.set_enabled("update_active reactivated task").await?;
        }
        self.last_active = now_seconds();
        self.runtime
            .store()
            .lock()
            .await
            .update_task_last_active(&self.task_id, self.version, self.last_active)
            .await
    }

    /// Find a schedule set by id.
    pub fn get_schedule_set(&self, set_id: &str) -> Option<&ScheduleSet> {
        self.schedule_sets
            .iter()
            .find(|schedule| schedule.set_id.as_deref() == Some(set_id))
    }

    /// The most recent past cron tick for a schedule.
    pub fn get_last_scheduled(&self, schedule: &ScheduleSet) -> shared::Result<DateTime<Utc>> {
        previous_tick(&schedule.cron_schedule, Utc::now())
    }

    /// The next cron tick for a schedule (the first one when omitted).
    pub fn get_next_scheduled_time(
        &self,
        schedule: Option<&ScheduleSet>,
    ) -> shared::Result<DateTime<Utc>> {
        let schedule = match schedule {
            Some(schedule) => schedule,
            None => self
                .schedule_sets
                .first()
                .ok_or_else(|| anyhow!("Task '{}' has no schedule sets", self.task_id))?,
        };
        next_tick(&schedule.cron_schedule, Utc::now())
    }

    /// The interval between consecutive ticks of a schedule.
    pub fn get_time_between_runs(&self, schedule: &ScheduleSet) -> shared::Result<ChronoDuration> {
        tick_interval(&schedule.cron_schedule, Utc::now())
    }

    /// Whether a scheduled run is due for this schedule set.
    pub async fn is_run_due(&self, schedule: &ScheduleSet) -> shared::Result<bool> {
        let (is_due, _) = self.is_run_due_with_last(schedule).await?;
        Ok(is_due)
    }

    /// Whether a run is due, together with the latest scheduled run.
    ///
    /// Due iff no scheduled run exists yet, or the latest one represents a
    /// tick earlier than the most recent past tick. Returning the last run
    /// saves the scheduler a second latest-run query.
    pub async fn is_run_due_with_last(
        &self,
        schedule: &ScheduleSet,
    ) -> shared::Result<(bool, Option<RunItem>)> {
        let last_run =
            RunItem::get_latest(self, Some(schedule), Some(RunType::Scheduled)).await?;
        match last_run {
            None => Ok((true, None)),
            Some(last_run) => {
                let last_tick = self.get_last_scheduled(schedule)?.timestamp();
                Ok((last_run.scheduled_time < last_tick, Some(last_run)))
            }
        }
    }

    /// Queue a scheduled run at the most recent past tick.
    ///
    /// Creates the run regardless of whether one is due.
    pub async fn schedule_run(&self, schedule: &ScheduleSet) -> shared::Result<RunItem> {
        let scheduled_time = self.get_last_scheduled(schedule)?.timestamp();
        RunItem::create(self, RunType::Scheduled, schedule, scheduled_time).await
    }

    /// Queue a triggered run carrying the id of the task that triggered it.
    pub async fn trigger_run(
        &self,
        schedule: &ScheduleSet,
        source_task: &TaskItem,
        scheduled_time: i64,
    ) -> shared::Result<RunItem> {
        let mut run = RunItem::create(self, RunType::Triggered, schedule, scheduled_time).await?;
        run.set_output(Some(json!({ "trigger_task": source_task.task_id })), true)
            .await?;
        Ok(run)
    }

    /// Latest run for this task, any run type.
    pub async fn get_last_run(
        &self,
        schedule: Option<&ScheduleSet>,
    ) -> shared::Result<Option<RunItem>> {
        RunItem::get_latest(self, schedule, None).await
    }

    /// The latest `count` runs, ordered by scheduled time descending.
    pub async fn get_latest_runs(
        &self,
        schedule: Option<&ScheduleSet>,
        count: usize,
    ) -> shared::Result<Vec<RunItem>> {
        let mut runs = RunItem::get_all(self, 0, schedule, None).await?;
        runs.sort_by(|a, b| b.scheduled_time.cmp(&a.scheduled_time));
        runs.truncate(count);
        Ok(runs)
    }

    /// Runs currently queued for this task.
    pub async fn get_queued_runs(&self) -> shared::Result<Vec<RunItem>> {
        RunItem::get_all_queued(self, None).await
    }

    /// Runs currently marked running for this task.
    pub async fn get_running_runs(&self) -> shared::Result<Vec<RunItem>> {
        RunItem::get_running_runs(self, None).await
    }

    /// Delete runs scheduled earlier than `now - max_age`; returns the
    /// number of rows deleted. `None` disables pruning for this call.
    pub async fn prune_runs(&self, max_age: Option<Duration>) -> shared::Result<usize> {
        let Some(max_age) = max_age else {
            return Ok(0);
        };
        let cutoff = now_seconds() - max_age.as_secs() as i64;
        self.runtime
            .store()
            .lock()
            .await
            .delete_runs_before(&self.task_id, cutoff)
            .await
    }

    /// Invoke this task's function the way the runner would.
    ///
    /// Fails for tasks loaded from the store without an in-process
    /// registration, which carry no function.
    pub async fn run_function(
        &self,
        handle: RunHandle,
        config: Value,
    ) -> anyhow::Result<()> {
        let function = self.task_function.clone().ok_or_else(|| {
            anyhow::Error::from(OrchestratorError::Config(format!(
                "Task '{}' has no function registered in this process",
                self.task_id
            )))
        })?;
        function(self.clone(), handle, config).await
    }
}
