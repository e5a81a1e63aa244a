//! End-to-end tests for the task runner

use crate::modules::{invoke, Module, ModuleKind};
use crate::runner::TaskRunner;
use crate::runs::{RunItem, RunStatus, RunType};
use crate::runtime::{Runtime, RuntimeOptions};
use crate::tasks::{NewTask, ScheduleSet, TaskFunction, TaskItem, TriggerTask};
use crate::tests::support::noop_function;
use serde_json::json;
use shared::config::{ModuleConfig, RunnerConfig, StoreConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Runtime with registration checks on, plus a manually-driven runner
/// claiming the registration hook.
async fn runner_fixture() -> (TempDir, Arc<Runtime>, Arc<TaskRunner>) {
    let temp_dir = TempDir::new().unwrap();
    let runtime = Runtime::initialise(
        &StoreConfig::new(temp_dir.path()),
        RuntimeOptions::new("runner-tests"),
    )
    .await
    .unwrap();

    let config = RunnerConfig {
        spawn_workers: false,
        poll_interval_seconds: 1,
        heartbeat_interval_seconds: 1,
        ..RunnerConfig::default()
    };
    let runner = TaskRunner::new(Arc::clone(&runtime), config, true).unwrap();
    (temp_dir, runtime, runner)
}

async fn create_task(
    runtime: &Arc<Runtime>,
    task_id: &str,
    schedule: ScheduleSet,
    function: TaskFunction,
) -> TaskItem {
    TaskItem::create(
        runtime,
        NewTask::new(task_id, task_id, "runner test task", vec![schedule], function),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_create_without_runner_fails() {
    let temp_dir = TempDir::new().unwrap();
    let runtime = Runtime::initialise(
        &StoreConfig::new(temp_dir.path()),
        RuntimeOptions::new("no-runner"),
    )
    .await
    .unwrap();

    let result = TaskItem::create(
        &runtime,
        NewTask::new(
            "t1",
            "t1",
            "no runner in this process",
            vec![ScheduleSet::new("* * * * *", json!({}))],
            noop_function(),
        ),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_only_one_default_runner_per_runtime() {
    let (_dir, runtime, _runner) = runner_fixture().await;

    let config = RunnerConfig {
        spawn_workers: false,
        ..RunnerConfig::default()
    };
    assert!(TaskRunner::new(Arc::clone(&runtime), config, true).is_err());
}

#[tokio::test]
async fn test_successful_run_records_output_and_run_times() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let function: TaskFunction = Arc::new(|_task, handle, _config| {
        Box::pin(async move {
            let mut run = handle.run.clone();
            run.set_output(Some(json!({"data": "hi"})), true).await?;
            Ok(())
        })
    });
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({})),
        function,
    )
    .await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert!(stored.start_time.is_some());
    assert!(stored.end_time.is_some());

    let output = stored.output.unwrap();
    assert_eq!(output["data"], json!("hi"));
    assert_eq!(output["run_times"], json!([]));
}

#[tokio::test]
async fn test_run_that_warns_stays_warned() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let function: TaskFunction = Arc::new(|_task, handle, _config| {
        Box::pin(async move {
            let mut run = handle.run.clone();
            run.set_warn(Some(json!({"message": "w"}))).await?;
            Ok(())
        })
    });
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({})),
        function,
    )
    .await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Warn);
    let output = stored.output.unwrap();
    assert_eq!(output["message"], json!("w"));
    assert_eq!(output["run_times"], json!([]));
}

#[tokio::test]
async fn test_failing_function_marks_run_failed() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let function: TaskFunction = Arc::new(|_task, _handle, _config| {
        Box::pin(async { Err(anyhow::anyhow!("extract blew up")) })
    });
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({})),
        function,
    )
    .await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    let exception = stored.output.unwrap()["exception"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(exception.contains("extract blew up"));

    // No broker configured: the failure publish lands in the durable log.
    let entries = runtime.logs("tasks").get_entries().await.unwrap();
    assert!(entries
        .iter()
        .any(|entry| entry.entry_text == "run failed with no broker configured"));
}

#[tokio::test]
async fn test_module_retries_demote_run_to_warn() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let attempts = Arc::new(AtomicU32::new(0));
    let function: TaskFunction = {
        let attempts = Arc::clone(&attempts);
        Arc::new(move |_task, handle, _config| {
            let attempts = Arc::clone(&attempts);
            Box::pin(async move {
                let module = Module::new("flaky_source", "fails once", ModuleKind::Source);
                let module_config = ModuleConfig {
                    max_retries: 1,
                    retry_interval_seconds: 0,
                };
                invoke(&handle.context, &module, &module_config, || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(anyhow::anyhow!("transient failure"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
            })
        })
    };
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({})),
        function,
    )
    .await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Warn);

    let output = stored.output.unwrap();
    let run_times = output["run_times"].as_array().unwrap();
    assert_eq!(run_times.len(), 2);
    assert_eq!(run_times[0]["retry_count"], json!(0));
    assert_eq!(run_times[1]["retry_count"], json!(1));
    assert!(output["message"].as_str().unwrap().contains("had 1 retries"));
}

#[tokio::test]
async fn test_successful_run_creates_triggered_run() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let target = create_task(
        &runtime,
        "b",
        ScheduleSet::new("* * * * *", json!({})),
        noop_function(),
    )
    .await;

    let schedule = ScheduleSet::with_trigger(
        "* * * * *",
        json!({}),
        TriggerTask {
            task_id: "b".to_string(),
            set_id: None,
        },
    );
    let source = create_task(&runtime, "a", schedule, noop_function()).await;

    let run = source.schedule_run(&source.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let source_run = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(source_run.status, RunStatus::Success);

    // Exactly one triggered run of B, at the source run's scheduled time.
    let triggered = RunItem::get_all(&target, 0, None, Some(RunType::Triggered))
        .await
        .unwrap();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].scheduled_time, run.scheduled_time);
    assert_eq!(
        triggered[0].output.as_ref().unwrap()["trigger_task"],
        json!("a")
    );
}

#[tokio::test]
async fn test_missing_trigger_target_demotes_to_warn() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let schedule = ScheduleSet::with_trigger(
        "* * * * *",
        json!({}),
        TriggerTask {
            task_id: "does_not_exist".to_string(),
            set_id: None,
        },
    );
    let task = create_task(&runtime, "a", schedule, noop_function()).await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Warn);
    assert!(stored.output.unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("Trigger task failed to create run"));
}

#[tokio::test]
async fn test_run_timeout_marks_run_failed() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let function: TaskFunction = Arc::new(|_task, _handle, _config| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
    });
    // One second budget via the run config override.
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({"timeout": 1})),
        function,
    )
    .await;

    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await;

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    let exception = stored.output.unwrap()["exception"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(exception.contains("timed out (timeout: 1s)"), "{exception}");
}

#[tokio::test]
async fn test_cancellation_aborts_the_run_and_sticks() {
    let (_dir, runtime, runner) = runner_fixture().await;

    let function: TaskFunction = Arc::new(|_task, _handle, _config| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
    });
    let task = create_task(
        &runtime,
        "t1",
        ScheduleSet::new("* * * * *", json!({})),
        function,
    )
    .await;
    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();

    let processing = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.process_all_tasks().await })
    };

    // Let the run get going, then cancel it out from under the worker.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut handle = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    handle
        .set_cancelled(Some(json!({"message": "operator cancelled"})), false)
        .await
        .unwrap();

    // The heartbeat observes the cancellation, expires the timeout budget
    // and the waiter aborts the function.
    tokio::time::timeout(Duration::from_secs(20), processing)
        .await
        .expect("runner did not abort the cancelled run")
        .unwrap();

    let stored = RunItem::get(&runtime, &run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(
        stored.output.unwrap()["message"],
        json!("operator cancelled")
    );
}

#[tokio::test]
async fn test_worker_lifecycle_management() {
    let (_dir, runtime, _runner) = runner_fixture().await;

    // A second, spawning runner managed by hand (not the default one).
    let config = RunnerConfig {
        spawn_workers: true,
        poll_interval_seconds: 1,
        heartbeat_interval_seconds: 1,
        ..RunnerConfig::default()
    };
    let runner = TaskRunner::new(Arc::clone(&runtime), config, false).unwrap();

    let mut new_task = NewTask::new(
        "grouped",
        "grouped",
        "lifecycle test",
        vec![ScheduleSet::new("* * * * *", json!({}))],
        noop_function(),
    );
    new_task.thread_group = "etl_group".to_string();
    new_task.register_with_runner = false;
    let task = TaskItem::create(&runtime, new_task).await.unwrap();

    runner.register_task(task).await;
    assert!(runner.dead_groups().await.is_empty());

    runner.stop_all(true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runner.dead_groups().await, vec!["etl_group".to_string()]);

    runner.start_all(true).await;
    assert!(runner.dead_groups().await.is_empty());
    runner.stop_all(true).await;
}
