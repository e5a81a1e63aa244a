//! Scheduler
//!
//! Three cooperating loops over a shared in-memory task cache:
//!
//! - the due-detection loop computes which schedules are due and queues
//!   fresh runs, failing unstarted previous runs and parking stale tasks
//!   along the way;
//! - the prune loop ages out old runs and log entries;
//! - the historical-failer loop forces any run stuck in `queued` or
//!   `running` past the configured age into `failed`, which guarantees
//!   every run reaches a terminal state even when everything else is down.
//!
//! The loops are idempotent but not coordinated across processes: run at
//! most one scheduler instance (and one runner per thread group) against a
//! given store, or duplicate queued runs will appear.

use serde_json::json;
use shared::config::SchedulerConfig;
use shared::utils::now_seconds;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::logs::LogManager;
use crate::runs::RunStatus;
use crate::runtime::Runtime;
use crate::tasks::{TaskItem, TaskStatus};

/// Represents the possible states of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// The scheduler: refreshes the task cache and drives the three loops.
pub struct Scheduler {
    runtime: Arc<Runtime>,
    config: SchedulerConfig,
    /// Task cache shared by all three loops, refreshed from the store
    /// every `task_refresh_interval_seconds`
    all_tasks: Arc<RwLock<Vec<TaskItem>>>,
    /// Unix seconds of the last cache refresh
    last_refresh: AtomicI64,
    is_running: Arc<AtomicBool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    logs: LogManager,
}

impl Scheduler {
    pub fn new(runtime: Arc<Runtime>, config: SchedulerConfig) -> shared::Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            logs: runtime.logs("scheduler"),
            runtime,
            config,
            all_tasks: Arc::new(RwLock::new(Vec::new())),
            last_refresh: AtomicI64::new(0),
            is_running: Arc::new(AtomicBool::new(false)),
            handles: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> SchedulerState {
        if self.is_running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    /// Start the three loops on their own tasks.
    pub async fn start(self: &Arc<Self>) -> shared::Result<()> {
        self.logs.add_entry("status", "Starting", json!({})).await?;
        self.is_running.store(true, Ordering::SeqCst);

        let mut handles = self.handles.lock().expect("scheduler handle lock poisoned");

        // Due-detection loop
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let tick = Duration::from_secs(scheduler.config.poll_interval_seconds);
            while scheduler.is_running.load(Ordering::SeqCst) {
                tokio::time::sleep(tick).await;
                if let Err(e) = scheduler.process_schedules_once().await {
                    warn!("Schedule processing pass failed: {:#}", e);
                }
            }
        }));

        // Prune loop
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let tick = Duration::from_secs(scheduler.config.prune_interval_seconds);
            while scheduler.is_running.load(Ordering::SeqCst) {
                tokio::time::sleep(tick).await;
                if let Err(e) = scheduler.prune_once().await {
                    warn!("Prune pass failed: {:#}", e);
                }
            }
        }));

        // Historical-failer loop
        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let tick = Duration::from_secs(scheduler.config.fail_historical_interval_seconds);
            while scheduler.is_running.load(Ordering::SeqCst) {
                tokio::time::sleep(tick).await;
                if let Err(e) = scheduler.fail_historical_once().await {
                    warn!("Historical-failer pass failed: {:#}", e);
                }
            }
        }));

        Ok(())
    }

    /// Stop all loops.
    pub async fn stop(&self) -> shared::Result<()> {
        self.logs.add_entry("status", "Stopping", json!({})).await?;
        self.is_running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .expect("scheduler handle lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    /// Reload the task cache when the refresh interval has elapsed, or
    /// immediately when the cache is empty (e.g. on first use).
    pub async fn refresh_tasks_if_needed(&self) -> shared::Result<()> {
        let now = now_seconds();
        let refresh_due = self.last_refresh.load(Ordering::SeqCst)
            < now - self.config.task_refresh_interval_seconds as i64;
        let cache_empty = self.all_tasks.read().await.is_empty();

        if refresh_due || cache_empty {
            let tasks = TaskItem::get_all(&self.runtime).await?;
            self.logs
                .add_entry("run", "Refreshing tasks", json!({ "task_count": tasks.len() }))
                .await?;
            *self.all_tasks.write().await = tasks;
            self.last_refresh.store(now, Ordering::SeqCst);
        }
        Ok(())
    }

    /// One pass of the due-detection loop over every cached task.
    pub async fn process_schedules_once(&self) -> shared::Result<()> {
        self.refresh_tasks_if_needed().await?;

        let tasks = self.all_tasks.read().await.clone();
        for task in tasks {
            if let Err(e) = self.process_task_schedules(task).await {
                warn!("Due detection failed for a task: {:#}", e);
            }
        }
        Ok(())
    }

    /// Due detection for one task: walk its schedule sets and queue a run
    /// for each one that is due.
    async fn process_task_schedules(&self, mut task: TaskItem) -> shared::Result<()> {
        for schedule in task.schedule_sets.clone() {
            // Only enabled tasks are scheduled.
            if task.status != TaskStatus::Enabled {
                continue;
            }

            let (is_due, last_run) = task.is_run_due_with_last(&schedule).await?;
            if !is_due {
                continue;
            }

            if self.config.fail_unstarted_runs {
                // The previous run never started; fail it before queuing
                // a replacement.
                if let Some(last_run) = &last_run {
                    if last_run.start_time.is_none() && last_run.status == RunStatus::Queued {
                        let mut last_run = last_run.clone();
                        last_run
                            .set_failed(
                                Some(json!({ "message": "Previous run failed to start" })),
                                false,
                            )
                            .await?;
                    }
                }
            }

            if self.config.disable_stale_tasks {
                // No heartbeat since the last run means no worker owns this
                // task any more; park it instead of queuing runs forever.
                // A live worker heartbeats many times per tick, so a single
                // missed window is already conclusive.
                if let Some(last_run) = &last_run {
                    if task.last_active < last_run.scheduled_time {
                        task.set_status(
                            TaskStatus::Inactive,
                            "Task has been inactive since last scheduled run",
                        )
                        .await?;
                        continue;
                    }
                }
            }

            let run = task.schedule_run(&schedule).await?;
            debug!(
                "Queued run {} for task '{}' schedule {:?}",
                run.run_id, task.task_id, schedule.set_id
            );
        }
        Ok(())
    }

    /// One pass of the prune loop: age out runs per task, then log entries.
    pub async fn prune_once(&self) -> shared::Result<()> {
        self.refresh_tasks_if_needed().await?;

        if let Some(max_age) = self.config.prune_runs_max_age() {
            let tasks = self.all_tasks.read().await.clone();
            for task in &tasks {
                let deleted = task.prune_runs(Some(max_age)).await?;
                self.logs
                    .add_entry(
                        "prune_runs",
                        "Pruning runs",
                        json!({
                            "task_id": task.task_id,
                            "max_age_seconds": max_age.as_secs(),
                            "deleted_count": deleted,
                        }),
                    )
                    .await?;
            }
        }

        if let Some(max_age) = self.config.prune_logs_max_age() {
            let deleted = self.logs.prune(max_age).await?;
            self.logs
                .add_entry(
                    "prune_logs",
                    "Pruning logs",
                    json!({
                        "max_age_seconds": max_age.as_secs(),
                        "deleted_count": deleted,
                    }),
                )
                .await?;
        }

        Ok(())
    }

    /// One pass of the historical-failer loop: any run still open past the
    /// configured age is forced to `failed` with zero duration.
    pub async fn fail_historical_once(&self) -> shared::Result<()> {
        if !self.config.fail_historical_runs {
            return Ok(());
        }
        let Some(max_age) = self.config.fail_historical_age() else {
            return Ok(());
        };

        self.refresh_tasks_if_needed().await?;
        let cutoff = now_seconds() - max_age.as_secs() as i64;

        let tasks = self.all_tasks.read().await.clone();
        for task in &tasks {
            let mut open_runs = task.get_running_runs().await?;
            open_runs.extend(task.get_queued_runs().await?);

            let mut failed_count = 0;
            for mut run in open_runs {
                if run.scheduled_time < cutoff {
                    run.set_failed(
                        Some(json!({ "message": "Historical run failed to start/finish" })),
                        true,
                    )
                    .await?;
                    failed_count += 1;
                }
            }

            self.logs
                .add_entry(
                    "fail_historical_runs",
                    "Failing historical runs",
                    json!({
                        "task_id": task.task_id,
                        "max_age_seconds": max_age.as_secs(),
                        "failed_count": failed_count,
                    }),
                )
                .await?;
        }

        Ok(())
    }
}
