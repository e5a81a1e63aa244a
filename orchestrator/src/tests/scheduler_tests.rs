//! Tests for the scheduler's three loops

use crate::runs::{RunItem, RunStatus, RunType};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::tasks::{TaskItem, TaskStatus};
use crate::tests::support::{create_minute_task, test_runtime};
use chrono::Utc;
use serde_json::json;
use shared::config::SchedulerConfig;
use std::sync::Arc;

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        // Refresh the cache on every pass so tests see their own writes.
        task_refresh_interval_seconds: 0,
        poll_interval_seconds: 1,
        prune_interval_seconds: 1,
        fail_historical_interval_seconds: 1,
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn test_start_and_stop() {
    let (_dir, runtime) = test_runtime().await;
    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();

    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    scheduler.start().await.unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Running);
    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_due_task_gets_a_queued_run() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();

    scheduler.process_schedules_once().await.unwrap();

    let queued = task.get_queued_runs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].run_type, RunType::Scheduled);
    assert!(queued[0].scheduled_time <= Utc::now().timestamp());
}

#[tokio::test]
async fn test_disabled_task_is_skipped() {
    let (_dir, runtime) = test_runtime().await;
    let mut task = create_minute_task(&runtime, "t1").await;
    task.set_status(TaskStatus::Disabled, "off").await.unwrap();

    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();
    scheduler.process_schedules_once().await.unwrap();

    assert!(task.get_queued_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unstarted_previous_run_is_failed_before_requeue() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();

    // A queued run from an hour-old tick that never started.
    let old_run = RunItem::create(
        &task,
        RunType::Scheduled,
        &schedule,
        Utc::now().timestamp() - 3_600,
    )
    .await
    .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();
    scheduler.process_schedules_once().await.unwrap();

    let failed = RunItem::get(&runtime, &old_run.run_id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(
        failed.output.unwrap()["message"],
        json!("Previous run failed to start")
    );

    // A fresh run was queued for the current tick.
    let queued = task.get_queued_runs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].scheduled_time > old_run.scheduled_time);
}

#[tokio::test]
async fn test_stale_task_is_parked_inactive() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let now = Utc::now().timestamp();

    // Last heartbeat three hours ago, last run two hours ago: no worker
    // has owned this task since that run.
    let mut row = task.to_row().unwrap();
    row.last_active = now - 3 * 3_600;
    runtime.store().lock().await.upsert_task(&row).await.unwrap();
    let stale_run = RunItem::create(&task, RunType::Scheduled, &schedule, now - 2 * 3_600)
        .await
        .unwrap();
    // Give the run a start time so the unstarted-run path stays out of
    // the way of this test.
    let mut stale_run_handle =
        RunItem::get(&runtime, &stale_run.run_id).await.unwrap().unwrap();
    stale_run_handle.set_running(None).await.unwrap();
    stale_run_handle.set_success(None).await.unwrap();

    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();
    scheduler.process_schedules_once().await.unwrap();

    let stored = TaskItem::get(&runtime, "t1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Inactive);
    assert_eq!(
        stored.notes.as_deref(),
        Some("Task has been inactive since last scheduled run")
    );
    // Parked tasks get no new runs.
    assert!(task.get_queued_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_detection_can_be_disabled() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let now = Utc::now().timestamp();

    let mut row = task.to_row().unwrap();
    row.last_active = now - 3 * 3_600;
    runtime.store().lock().await.upsert_task(&row).await.unwrap();
    let mut old_run = RunItem::create(&task, RunType::Scheduled, &schedule, now - 2 * 3_600)
        .await
        .unwrap();
    old_run.set_running(None).await.unwrap();
    old_run.set_success(None).await.unwrap();

    let config = SchedulerConfig {
        disable_stale_tasks: false,
        ..test_config()
    };
    let scheduler = Scheduler::new(Arc::clone(&runtime), config).unwrap();
    scheduler.process_schedules_once().await.unwrap();

    let stored = TaskItem::get(&runtime, "t1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Enabled);
    assert_eq!(task.get_queued_runs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_historical_runs_are_failed_with_zero_duration() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let now = Utc::now().timestamp();

    // 25 hours old with a 24 hour cutoff: gets failed. One hour old:
    // left alone.
    let ancient = RunItem::create(&task, RunType::Scheduled, &schedule, now - 25 * 3_600)
        .await
        .unwrap();
    let recent = RunItem::create(&task, RunType::Scheduled, &schedule, now - 3_600)
        .await
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();
    scheduler.fail_historical_once().await.unwrap();

    let failed = RunItem::get(&runtime, &ancient.run_id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.start_time, failed.end_time);
    assert_eq!(
        failed.output.unwrap()["message"],
        json!("Historical run failed to start/finish")
    );

    let untouched = RunItem::get(&runtime, &recent.run_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Queued);
}

#[tokio::test]
async fn test_historical_failer_respects_disabled_config() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let ancient = RunItem::create(
        &task,
        RunType::Scheduled,
        &schedule,
        Utc::now().timestamp() - 25 * 3_600,
    )
    .await
    .unwrap();

    let config = SchedulerConfig {
        fail_historical_runs: false,
        ..test_config()
    };
    let scheduler = Scheduler::new(Arc::clone(&runtime), config).unwrap();
    scheduler.fail_historical_once().await.unwrap();

    let untouched = RunItem::get(&runtime, &ancient.run_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Queued);
}

#[tokio::test]
async fn test_prune_pass_deletes_old_runs_and_logs() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let now = Utc::now().timestamp();

    let recent = RunItem::create(&task, RunType::Scheduled, &schedule, now - 120)
        .await
        .unwrap();
    let ancient = RunItem::create(&task, RunType::Scheduled, &schedule, now - 1_000 * 86_400)
        .await
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&runtime), test_config()).unwrap();
    scheduler.prune_once().await.unwrap();

    assert!(RunItem::get(&runtime, &recent.run_id).await.unwrap().is_some());
    assert!(RunItem::get(&runtime, &ancient.run_id).await.unwrap().is_none());

    // The pass records what it did in the durable log.
    let entries = runtime.logs("scheduler").get_entries().await.unwrap();
    assert!(entries
        .iter()
        .any(|entry| entry.entry_category == "prune_runs"
            && entry.entry_json["deleted_count"] == json!(1)));
}

#[tokio::test]
async fn test_prune_pass_skips_when_ages_unset() {
    let (_dir, runtime) = test_runtime().await;
    let task = create_minute_task(&runtime, "t1").await;
    let schedule = task.schedule_sets[0].clone();
    let ancient = RunItem::create(
        &task,
        RunType::Scheduled,
        &schedule,
        Utc::now().timestamp() - 1_000 * 86_400,
    )
    .await
    .unwrap();

    let config = SchedulerConfig {
        prune_runs_max_age_days: None,
        prune_logs_max_age_days: None,
        ..test_config()
    };
    let scheduler = Scheduler::new(Arc::clone(&runtime), config).unwrap();
    scheduler.prune_once().await.unwrap();

    assert!(RunItem::get(&runtime, &ancient.run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_task_cache_honours_refresh_interval() {
    let (_dir, runtime) = test_runtime().await;

    // Interval large enough to never elapse during the test; the first
    // pass still fills the cache.
    let config = SchedulerConfig {
        task_refresh_interval_seconds: 10_000,
        ..test_config()
    };
    let scheduler = Scheduler::new(Arc::clone(&runtime), config).unwrap();

    let task = create_minute_task(&runtime, "t1").await;
    scheduler.process_schedules_once().await.unwrap();
    assert_eq!(task.get_queued_runs().await.unwrap().len(), 1);

    // A task created after the initial fill is invisible until the
    // refresh interval elapses.
    let late_task = create_minute_task(&runtime, "t2").await;
    scheduler.process_schedules_once().await.unwrap();
    assert!(late_task.get_queued_runs().await.unwrap().is_empty());
}
