//! Shared helpers for orchestrator tests

use crate::runtime::{Runtime, RuntimeOptions};
use crate::tasks::{NewTask, ScheduleSet, TaskFunction, TaskItem};
use serde_json::json;
use shared::config::StoreConfig;
use std::sync::Arc;
use tempfile::TempDir;

/// Build a runtime over a throwaway store. Registration checks are
/// skipped so tasks can be created without a runner in place; runner
/// tests construct their own runtime with the check enabled.
pub async fn test_runtime() -> (TempDir, Arc<Runtime>) {
    let temp_dir = TempDir::new().unwrap();
    let mut options = RuntimeOptions::new("tests");
    options.skip_registration_check = true;

    let runtime = Runtime::initialise(&StoreConfig::new(temp_dir.path()), options)
        .await
        .unwrap();
    (temp_dir, runtime)
}

/// A task function that does nothing and succeeds.
pub fn noop_function() -> TaskFunction {
    Arc::new(|_task, _handle, _config| Box::pin(async { Ok(()) }))
}

/// A minute-cron schedule set with an empty config.
pub fn minute_schedule() -> ScheduleSet {
    ScheduleSet::new("* * * * *", json!({}))
}

/// Create a task on the minute cron with a no-op function.
pub async fn create_minute_task(runtime: &Arc<Runtime>, task_id: &str) -> TaskItem {
    TaskItem::create(
        runtime,
        NewTask::new(
            task_id,
            &format!("{task_id} name"),
            "test task",
            vec![minute_schedule()],
            noop_function(),
        ),
    )
    .await
    .unwrap()
}
