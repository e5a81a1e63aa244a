//! Task runner
//!
//! The runner owns one worker loop per thread group. Each worker cycles
//! over its registered tasks, heartbeats their liveness and executes every
//! queued run serially. Per run it starts a heartbeat task that keeps the
//! run's `last_active` fresh, lifts module timings into the run output and
//! watches for cancellation, while a waiter enforces the timeout budget.
// The timeout is a budget counter, not a hard interrupt: the waiter ticks
// it down once per second and aborts the execution task when it reaches
// zero. The heartbeat can expire the same budget when it observes a
// cancelled status, which funnels cancellation through the timeout path.
// A worker that is past its last await point simply finishes; its eventual
// state write loses to the already-terminal run row.

use anyhow::anyhow;
use serde_json::{json, Value};
use shared::config::RunnerConfig;
use shared::OrchestratorError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::logs::LogManager;
use crate::modules::RunContext;
use crate::runs::{RunItem, RunStatus};
use crate::runtime::Runtime;
use crate::tasks::{TaskItem, TriggerTask};

/// Tasks with no explicit thread group land here; it is also the fallback
/// when thread groups are disabled entirely.
pub const BASE_THREAD_GROUP: &str = "base_thread";

/// Handed to every task function: the live run plus the shared per-run
/// context used for module telemetry and the timeout budget.
#[derive(Clone)]
pub struct RunHandle {
    pub run: RunItem,
    pub context: Arc<RunContext>,
}

/// Worker owning all tasks of one thread group. Tasks in a group run
/// serially; liveness for the whole group is refreshed before each task so
/// a long-running run does not get its siblings marked stale.
pub(crate) struct GroupWorker {
    thread_group: String,
    runtime: Arc<Runtime>,
    config: RunnerConfig,
    tasks: RwLock<Vec<TaskItem>>,
    is_running: AtomicBool,
    join_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    logs: LogManager,
}

impl GroupWorker {
    fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn new(runtime: Arc<Runtime>, config: RunnerConfig, thread_group: &str) -> Self {
        Self {
            thread_group: thread_group.to_string(),
            logs: runtime.logs("task_runner"),
            runtime,
            config,
            tasks: RwLock::new(Vec::new()),
            is_running: AtomicBool::new(false),
            join_handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawn this worker's loop.
    fn start(self: &Arc<Self>) {
        self.is_running.store(true, Ordering::SeqCst);
        let worker = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let poll_interval = Duration::from_secs(worker.config.poll_interval_seconds);
            while worker.is_running.load(Ordering::SeqCst) {
                let tasks = worker.tasks.read().await.clone();
                for task in &tasks {
                    // Heartbeat every task in the group before each one is
                    // processed, guaranteeing at least one update per cycle.
                    worker.update_active_all_tasks().await;
                    worker.process_task(task).await;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        *self
            .join_handle
            .lock()
            .expect("worker handle lock poisoned") = Some(handle);
    }

    fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .join_handle
            .lock()
            .expect("worker handle lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Whether this worker's loop is alive.
    fn is_alive(&self) -> bool {
        self.join_handle
            .lock()
            .expect("worker handle lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Add a task, replacing any existing registration with the same id so
    /// a restarted process rebinds its in-memory task function.
    async fn add_task(&self, task: TaskItem) {
        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }

    /// Refresh `last_active` on every task in this group.
    ///
    /// While one task runs, every task in the group counts as active: this
    /// worker will get to them, even if it is busy with a long run now.
    async fn update_active_all_tasks(&self) {
        let mut tasks = self.tasks.write().await;
        for task in tasks.iter_mut() {
            if let Err(e) = task.update_active().await {
                warn!("Failed to heartbeat task '{}': {:#}", task.task_id, e);
            }
        }
    }

    /// Process every queued run of every task once.
    async fn process_all(self: &Arc<Self>) {
        let tasks = self.tasks.read().await.clone();
        for task in &tasks {
            self.process_task(task).await;
        }
    }

    /// Execute all currently-queued runs for a task.
    ///
    /// A task with several schedules can have runs queued simultaneously,
    /// so all of them are drained, serially, in the order the store
    /// returned them.
    async fn process_task(self: &Arc<Self>, task: &TaskItem) {
        let _ = self
            .logs
            .add_entry("running", "processing_task", json!({ "task": task.name }))
            .await;

        let queued_runs = match task.get_queued_runs().await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(
                    "Failed to fetch queued runs for task '{}': {:#}",
                    task.task_id, e
                );
                return;
            }
        };

        for run in queued_runs {
            let _ = self
                .logs
                .add_entry(
                    "running",
                    "running_task",
                    json!({ "task": task.name, "run_id": run.run_id }),
                )
                .await;
            self.process_run(task, run).await;
        }
    }

    /// Drive a single run through the execution protocol.
    async fn process_run(self: &Arc<Self>, task: &TaskItem, run: RunItem) {
        let timeout_seconds = run
            .config
            .get("timeout")
            .and_then(Value::as_i64)
            .filter(|timeout| *timeout > 0)
            .unwrap_or(self.config.default_timeout_seconds as i64);

        let context = Arc::new(RunContext::new(&run.run_id, timeout_seconds));

        let stop_heartbeat = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(self),
            run.clone(),
            Arc::clone(&context),
            Arc::clone(&stop_heartbeat),
        ));

        let execution = tokio::spawn(execute_run(
            task.clone(),
            run.clone(),
            Arc::clone(&context),
        ));

        // Timeout waiter: tick the budget down once per second and abort
        // the execution when it runs out. Cancellation expires the same
        // budget from the heartbeat.
        let mut timed_out = false;
        let joined = loop {
            if execution.is_finished() {
                break execution.await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if context.tick_down(1) <= 0 && !execution.is_finished() {
                timed_out = true;
                execution.abort();
                break execution.await;
            }
        };

        stop_heartbeat.store(true, Ordering::SeqCst);
        heartbeat.abort();

        let mut run = run;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The task function (or the run protocol around it) failed;
                // record the error chain and move on to the next run.
                let failure = run
                    .set_failed(Some(json!({ "exception": format!("{e:#}") })), false)
                    .await;
                if let Err(e) = failure {
                    warn!("Failed to mark run {} failed: {:#}", run.run_id, e);
                }
            }
            Err(join_error) => {
                let message = if timed_out {
                    format!(
                        "Task {} with run_id {} timed out (timeout: {}s)",
                        task.name, run.run_id, timeout_seconds
                    )
                } else if join_error.is_panic() {
                    format!("Task {} with run_id {} panicked", task.name, run.run_id)
                } else {
                    format!("Task {} with run_id {} was aborted", task.name, run.run_id)
                };
                debug!("{}", message);
                // No-op if the run was cancelled; that state is terminal.
                let failure = run
                    .set_failed(Some(json!({ "exception": message })), false)
                    .await;
                if let Err(e) = failure {
                    warn!("Failed to mark run {} failed: {:#}", run.run_id, e);
                }
            }
        }
    }
}

/// Per-run heartbeat: refresh run and group liveness, lift module timings
/// into the run output and watch for cancellation.
async fn heartbeat_loop(
    worker: Arc<GroupWorker>,
    run: RunItem,
    context: Arc<RunContext>,
    stop: Arc<AtomicBool>,
) {
    let interval = Duration::from_secs(worker.config.heartbeat_interval_seconds);

    loop {
        tokio::time::sleep(interval).await;
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let mut run = run.clone();
        if let Err(e) = run.update_active().await {
            warn!("Heartbeat failed to refresh run {}: {:#}", run.run_id, e);
        }

        worker.update_active_all_tasks().await;

        let lifted = run
            .set_output(Some(json!({ "run_times": context.run_times() })), true)
            .await;
        if let Err(e) = lifted {
            warn!("Heartbeat failed to lift run times for {}: {:#}", run.run_id, e);
        }

        match RunItem::get(worker.runtime(), &run.run_id).await {
            Ok(Some(current)) if current.status == RunStatus::Cancelled => {
                debug!("Run {} cancelled, expiring timeout budget", run.run_id);
                context.expire_timeout();
            }
            Ok(_) => {}
            Err(e) => warn!("Heartbeat failed to read run {}: {:#}", run.run_id, e),
        }
    }
}

/// The run execution protocol, from `set_running` to the terminal state.
async fn execute_run(
    task: TaskItem,
    mut run: RunItem,
    context: Arc<RunContext>,
) -> anyhow::Result<()> {
    context.clear_run_times();

    run.set_running(None).await?;
    // Brief pause so the transition is observable before user code runs.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = RunHandle {
        run: run.clone(),
        context: Arc::clone(&context),
    };
    let function_result = task.run_function(handle, run.config.clone()).await;

    // Lift the final module timings whether the function succeeded or not.
    run.set_output(Some(json!({ "run_times": context.run_times() })), true)
        .await?;

    // Any retried module demotes the run to warn; an already-failed run
    // gets the note under retry_message so the failure text survives.
    run.reload().await?;
    let retried: Vec<u64> = run
        .output
        .as_ref()
        .and_then(|output| output.get("run_times"))
        .and_then(Value::as_array)
        .map(|times| {
            times
                .iter()
                .filter_map(|entry| entry.get("retry_count").and_then(Value::as_u64))
                .filter(|count| *count > 0)
                .collect()
        })
        .unwrap_or_default();
    for retry_count in retried {
        let message = format!("Run {} had {} retries", run.run_id, retry_count);
        if run.status == RunStatus::Failed {
            run.set_output(Some(json!({ "retry_message": message })), true)
                .await?;
        } else {
            run.set_warn(Some(json!({ "message": message }))).await?;
        }
    }

    // Surface the captured function error once the telemetry is recorded.
    function_result?;

    // Trigger evaluation and success only apply when nothing else has
    // touched the status; a function that set warn/failed/cancelled (or
    // success) itself wins.
    run.reload().await?;
    if run.status == RunStatus::Running {
        if let Some(schedule) = task.get_schedule_set(&run.set_id) {
            if let Some(trigger) = schedule.trigger_task.clone() {
                if let Err(e) = create_triggered_run(&task, &run, &trigger).await {
                    warn!(
                        "Trigger task failed for run {} of '{}': {:#}",
                        run.run_id, task.task_id, e
                    );
                    run.set_warn(Some(json!({
                        "message": format!("Trigger task failed to create run: {e:#}")
                    })))
                    .await?;
                }
            }
        }

        match run.set_success(None).await {
            Ok(()) => {}
            // A warn (from retries or the trigger path) already finalized
            // the run; success quietly yields to it.
            Err(e) if OrchestratorError::is_invalid_transition(&e) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Create the triggered run named by a schedule's trigger reference.
async fn create_triggered_run(
    task: &TaskItem,
    run: &RunItem,
    trigger: &TriggerTask,
) -> shared::Result<()> {
    let target = TaskItem::get(task.runtime(), &trigger.task_id)
        .await?
        .ok_or_else(|| anyhow!("Trigger task '{}' not found", trigger.task_id))?;

    let schedule = match &trigger.set_id {
        Some(set_id) => target
            .get_schedule_set(set_id)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Schedule set '{}' not found on trigger task '{}'",
                    set_id,
                    trigger.task_id
                )
            })?,
        None => target
            .schedule_sets
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Trigger task '{}' has no schedule sets", trigger.task_id))?,
    };

    target.trigger_run(&schedule, task, run.scheduled_time).await?;
    Ok(())
}

/// The task runner: routes tasks to per-group workers and manages their
/// lifecycles.
pub struct TaskRunner {
    runtime: Arc<Runtime>,
    config: RunnerConfig,
    handlers: RwLock<HashMap<String, Arc<GroupWorker>>>,
    /// Tasks arriving through the runtime's registration hook
    registration_rx: Mutex<mpsc::UnboundedReceiver<TaskItem>>,
    logs: LogManager,
}

impl TaskRunner {
    /// Create a runner.
    ///
    /// With `default_runner` it claims the runtime's registration hook so
    /// `TaskItem::create` can hand tasks to it; only one runner per
    /// runtime may do so. With `spawn_workers` set, a dispatcher task
    /// routes registrations as they arrive and worker loops run on their
    /// own; otherwise tests drive processing with `process_all_tasks`.
    pub fn new(
        runtime: Arc<Runtime>,
        config: RunnerConfig,
        default_runner: bool,
    ) -> shared::Result<Arc<Self>> {
        config.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        if default_runner {
            runtime.set_register_hook(sender)?;
        }

        let runner = Arc::new(Self {
            logs: runtime.logs("task_runner"),
            runtime,
            config,
            handlers: RwLock::new(HashMap::new()),
            registration_rx: Mutex::new(receiver),
        });

        if runner.config.spawn_workers {
            let dispatcher = Arc::clone(&runner);
            tokio::spawn(async move {
                // The dispatcher owns the receiver for the life of the
                // process; manual draining is only for spawn-less runners.
                let mut receiver = dispatcher.registration_rx.lock().await;
                while let Some(task) = receiver.recv().await {
                    dispatcher.register_task(task).await;
                }
            });
        }

        Ok(runner)
    }

    /// Register a task with the worker for its thread group, creating and
    /// starting the worker on first sight of the group.
    pub async fn register_task(&self, task: TaskItem) {
        let thread_group = if self.config.use_thread_groups {
            task.thread_group.clone()
        } else {
            BASE_THREAD_GROUP.to_string()
        };

        let _ = self
            .logs
            .add_entry(
                "setup",
                "registering_task",
                json!({ "task": task.name, "thread_group": thread_group }),
            )
            .await;

        let mut handlers = self.handlers.write().await;
        let worker = handlers.entry(thread_group.clone()).or_insert_with(|| {
            Arc::new(GroupWorker::new(
                Arc::clone(&self.runtime),
                self.config.clone(),
                &thread_group,
            ))
        });

        if self.config.spawn_workers && !worker.is_alive() {
            worker.start();
        }

        worker.add_task(task).await;
    }

    /// Register several tasks at once.
    pub async fn register_tasks(&self, tasks: Vec<TaskItem>) {
        for task in tasks {
            self.register_task(task).await;
        }
    }

    /// Drain pending registrations and process every queued run of every
    /// registered task once. This is the manual drive path for runners
    /// constructed with `spawn_workers` off.
    pub async fn process_all_tasks(&self) {
        // When a dispatcher owns the receiver this lock is held for the
        // process lifetime; skip draining rather than block.
        if let Ok(mut receiver) = self.registration_rx.try_lock() {
            let mut pending = Vec::new();
            while let Ok(task) = receiver.try_recv() {
                pending.push(task);
            }
            drop(receiver);
            for task in pending {
                self.register_task(task).await;
            }
        }

        let workers: Vec<Arc<GroupWorker>> =
            self.handlers.read().await.values().cloned().collect();
        for worker in workers {
            worker.process_all().await;
        }
    }

    /// Stop every worker loop; the base group only when `stop_base`.
    pub async fn stop_all(&self, stop_base: bool) {
        for (group, worker) in self.handlers.read().await.iter() {
            if group == BASE_THREAD_GROUP && !stop_base {
                continue;
            }
            worker.stop();
        }
    }

    /// Start (or restart) every worker loop that is not alive; the base
    /// group only when `start_base`.
    pub async fn start_all(&self, start_base: bool) {
        for (group, worker) in self.handlers.read().await.iter() {
            if group == BASE_THREAD_GROUP && !start_base {
                continue;
            }
            if !worker.is_alive() {
                worker.start();
            }
        }
    }

    /// Thread groups whose worker loop has died; empty when all are alive.
    pub async fn dead_groups(&self) -> Vec<String> {
        self.handlers
            .read()
            .await
            .iter()
            .filter(|(_, worker)| !worker.is_alive())
            .map(|(group, _)| group.clone())
            .collect()
    }
}
