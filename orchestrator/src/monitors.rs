//! Monitors and alerts
//!
//! Monitors consume broker messages and turn them into alerts through an
//! injected [`Alert`] sink. The one monitor the core ships is
//! [`FailedRunsMonitor`]: it watches `run_failed`, applies a
//! failure-window policy and suppresses alerts once a task is failing
//! saturated, so a wedged task cannot burn the alert channel's
//! reputation.

use anyhow::anyhow;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::channels::{RunFailedMessage, RUN_FAILED};
use crate::runs::{RunItem, RunStatus};
use crate::runtime::Runtime;
use crate::tasks::TaskItem;
use mqueue::ConsumerEndpoint;

/// An alert sink. Implementations deliver the message however they like;
/// the monitor only composes the text.
pub trait Alert: Send + Sync {
    fn send_alert(&self, message: &str);
}

/// Prints alerts to stdout. For tests and on-device instances where
/// console output is sufficient.
#[derive(Debug, Default)]
pub struct PrintAlert;

impl Alert for PrintAlert {
    fn send_alert(&self, message: &str) {
        println!("{message}");
    }
}

/// A monitor that can have tasks attached at task-creation time.
pub trait TaskMonitor: Send + Sync {
    fn add_task(&self, task: &TaskItem);
}

/// Number of recent runs inspected per failure check.
const FAILURE_WINDOW: usize = 7;
/// At this many failures in the window, alerts are suppressed until some
/// runs succeed again.
const SATURATION_THRESHOLD: usize = 5;

/// Alerts when runs of watched tasks fail some number of times.
///
/// On each `run_failed` message for a watched task, the last
/// [`FAILURE_WINDOW`] runs are fetched and their failures counted. At or
/// above [`SATURATION_THRESHOLD`] failures nothing is sent (the recipient
/// is expected to already be looking); otherwise an alert goes out once
/// the count reaches `failure_count`.
pub struct FailedRunsMonitor {
    runtime: Arc<Runtime>,
    monitor_name: String,
    alert: Arc<dyn Alert>,
    /// Failures in the window needed to alert
    failure_count: usize,
    task_ids: Mutex<HashSet<String>>,
}

impl TaskMonitor for FailedRunsMonitor {
    fn add_task(&self, task: &TaskItem) {
        self.task_ids
            .lock()
            .expect("monitor task set lock poisoned")
            .insert(task.task_id.clone());
    }
}

impl FailedRunsMonitor {
    pub fn new(
        runtime: Arc<Runtime>,
        monitor_name: &str,
        alert: Arc<dyn Alert>,
        failure_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            monitor_name: monitor_name.to_string(),
            alert,
            failure_count: failure_count.max(1),
            task_ids: Mutex::new(HashSet::new()),
        })
    }

    pub fn monitor_name(&self) -> &str {
        &self.monitor_name
    }

    /// Wire this monitor's check into a consumer endpoint for the
    /// `run_failed` channel and register with the broker.
    pub async fn subscribe(
        self: &Arc<Self>,
        consumer: &ConsumerEndpoint,
        consumer_name: &str,
    ) -> shared::Result<String> {
        let monitor = Arc::clone(self);
        consumer
            .register_consumer(consumer_name, &RUN_FAILED, move |message| {
                let monitor = Arc::clone(&monitor);
                async move {
                    if let Err(e) = monitor.check(message).await {
                        warn!("Failed-runs monitor check failed: {:#}", e);
                    }
                }
            })
            .await
    }

    /// Apply the failure-window policy to one `run_failed` message.
    pub async fn check(&self, message: RunFailedMessage) -> shared::Result<()> {
        // Only watched tasks concern this monitor.
        {
            let task_ids = self
                .task_ids
                .lock()
                .expect("monitor task set lock poisoned");
            if !task_ids.contains(&message.task_id) {
                return Ok(());
            }
        }

        let run = RunItem::get(&self.runtime, &message.run_id)
            .await?
            .ok_or_else(|| anyhow!("Run '{}' from message not found", message.run_id))?;
        let task = TaskItem::get(&self.runtime, &message.task_id)
            .await?
            .ok_or_else(|| anyhow!("Task '{}' from message not found", message.task_id))?;

        // Count failures over the window rather than trusting one message:
        // 4 failures, 1 success, 4 failures should keep alerting, while a
        // continuously wedged task saturates and goes quiet.
        let recent_runs = task.get_latest_runs(None, FAILURE_WINDOW).await?;
        let fail_count = recent_runs
            .iter()
            .filter(|run| run.status == RunStatus::Failed)
            .count();

        if fail_count >= SATURATION_THRESHOLD {
            info!(
                "Monitor '{}' suppressing alert for '{}': {} failures in window",
                self.monitor_name, task.task_id, fail_count
            );
            return Ok(());
        }

        if fail_count >= self.failure_count {
            let times_word = if fail_count == 1 { "time" } else { "times" };
            let output = serde_json::to_string_pretty(&run.output.clone().unwrap_or(json!(null)))
                .unwrap_or_else(|_| "null".to_string());
            let alert_message = format!(
                "Task {} has failed {} {}\n\nRun ID\n{}\n\nRun output:\n{}",
                self.task_link(&task),
                fail_count,
                times_word,
                self.run_link(&run),
                output
            );
            self.alert.send_alert(&alert_message);
        }

        Ok(())
    }

    /// The task's name, as a detail-page URL when one is configured.
    fn task_link(&self, task: &TaskItem) -> String {
        match &self.runtime.monitor_config().ui_base_url {
            Some(base_url) => format!("{}/task_details?task_id={} ({})", base_url, task.task_id, task.name),
            None => task.name.clone(),
        }
    }

    /// The run id, as a detail-page URL when one is configured.
    fn run_link(&self, run: &RunItem) -> String {
        match &self.runtime.monitor_config().ui_base_url {
            Some(base_url) => format!("{}/run_details?run_id={}", base_url, run.run_id),
            None => run.run_id.clone(),
        }
    }
}
