//! Configuration types and validation for the task orchestration system
//!
//! This module defines the configuration structures used by the scheduler,
//! task runner, module wrapper and message queue components, including
//! validation logic and serialization support.

use crate::defaults::*;
use crate::OrchestratorError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load a configuration value from a TOML file.
///
/// Shared by every binary and test that reads a config file, so path and
/// parse errors carry the offending file name consistently.
pub fn load_config_file<T: serde::de::DeserializeOwned>(path: &Path) -> crate::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Location and tuning of a SQLite-backed store.
///
/// Both the orchestrator store and the broker's message store use this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Directory holding the database file; created if missing
    pub data_dir: PathBuf,
    /// SQLite busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub busy_timeout_seconds: u64,
}

impl StoreConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            busy_timeout_seconds: default_database_busy_timeout(),
        }
    }
}

/// Configuration for the scheduler's three loops.
///
/// The nullable ages follow the original contract: `None` disables the
/// corresponding prune/fail pass entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Interval in seconds at which the task cache is reloaded from the store (default: 60)
    #[serde(default = "default_task_refresh_interval")]
    pub task_refresh_interval_seconds: u64,
    /// Due-detection loop tick in seconds (default: 15)
    #[serde(default = "default_schedule_poll_interval")]
    pub poll_interval_seconds: u64,
    /// If true, a due schedule whose previous run never started fails that run first (default: true)
    #[serde(default = "default_true")]
    pub fail_unstarted_runs: bool,
    /// If true, tasks that have not heartbeated since their last run are set inactive (default: true)
    #[serde(default = "default_true")]
    pub disable_stale_tasks: bool,
    /// Maximum age of runs to keep, in days; None disables run pruning (default: 180)
    #[serde(default = "default_prune_runs_max_age_days")]
    pub prune_runs_max_age_days: Option<u32>,
    /// Maximum age of log entries to keep, in days; None disables log pruning (default: 180)
    #[serde(default = "default_prune_logs_max_age_days")]
    pub prune_logs_max_age_days: Option<u32>,
    /// Prune loop tick in seconds (default: 3600)
    #[serde(default = "default_prune_interval")]
    pub prune_interval_seconds: u64,
    /// If true, open runs older than `fail_historical_age_hours` are failed (default: true)
    #[serde(default = "default_true")]
    pub fail_historical_runs: bool,
    /// Age in hours past which an open run is considered historical; None disables (default: 24)
    #[serde(default = "default_fail_historical_age_hours")]
    pub fail_historical_age_hours: Option<u32>,
    /// Historical-failer loop tick in seconds (default: 3600)
    #[serde(default = "default_fail_historical_interval")]
    pub fail_historical_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_refresh_interval_seconds: default_task_refresh_interval(),
            poll_interval_seconds: default_schedule_poll_interval(),
            fail_unstarted_runs: true,
            disable_stale_tasks: true,
            prune_runs_max_age_days: default_prune_runs_max_age_days(),
            prune_logs_max_age_days: default_prune_logs_max_age_days(),
            prune_interval_seconds: default_prune_interval(),
            fail_historical_runs: true,
            fail_historical_age_hours: default_fail_historical_age_hours(),
            fail_historical_interval_seconds: default_fail_historical_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Validate interval settings.
    pub fn validate(&self) -> crate::Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(OrchestratorError::Config(
                "Scheduler poll interval must be greater than zero".to_string(),
            )
            .into());
        }
        if self.prune_interval_seconds == 0 || self.fail_historical_interval_seconds == 0 {
            return Err(OrchestratorError::Config(
                "Scheduler prune and historical intervals must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn prune_runs_max_age(&self) -> Option<Duration> {
        self.prune_runs_max_age_days
            .map(|days| Duration::from_secs(u64::from(days) * 86_400))
    }

    pub fn prune_logs_max_age(&self) -> Option<Duration> {
        self.prune_logs_max_age_days
            .map(|days| Duration::from_secs(u64::from(days) * 86_400))
    }

    pub fn fail_historical_age(&self) -> Option<Duration> {
        self.fail_historical_age_hours
            .map(|hours| Duration::from_secs(u64::from(hours) * 3_600))
    }
}

/// Configuration for the task runner's worker loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// If false, every task lands on the base worker regardless of its thread group (default: true)
    #[serde(default = "default_true")]
    pub use_thread_groups: bool,
    /// If false, worker loops are not spawned; tests drive processing manually (default: true)
    #[serde(default = "default_true")]
    pub spawn_workers: bool,
    /// Worker loop tick in seconds (default: 15)
    #[serde(default = "default_runner_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Run liveness heartbeat interval in seconds (default: 15)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Run timeout in seconds unless the schedule config overrides it (default: 1800)
    #[serde(default = "default_run_timeout")]
    pub default_timeout_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            use_thread_groups: true,
            spawn_workers: true,
            poll_interval_seconds: default_runner_poll_interval(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            default_timeout_seconds: default_run_timeout(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.default_timeout_seconds == 0 {
            return Err(OrchestratorError::Config(
                "Default run timeout must be greater than zero".to_string(),
            )
            .into());
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(OrchestratorError::Config(
                "Heartbeat interval must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Retry configuration for module operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Maximum number of retries to attempt after the first failure (default: 1)
    #[serde(default = "default_module_max_retries")]
    pub max_retries: u32,
    /// Interval in seconds between retry attempts (default: 10)
    #[serde(default = "default_module_retry_interval")]
    pub retry_interval_seconds: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            max_retries: default_module_max_retries(),
            retry_interval_seconds: default_module_retry_interval(),
        }
    }
}

/// Configuration for the standalone broker service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Address the broker HTTP server binds to (default: 127.0.0.1:5801)
    #[serde(default = "default_broker_listen_address")]
    pub listen_address: String,
    /// Store location for the consumers and messages tables
    pub store: StoreConfig,
    /// Timeout in seconds for delivery POSTs to consumers (default: 5)
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
}

impl BrokerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            OrchestratorError::Config(format!(
                "Invalid broker listen address '{}': {}",
                self.listen_address, e
            ))
        })?;
        if self.delivery_timeout_seconds == 0 {
            return Err(OrchestratorError::Config(
                "Delivery timeout must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Configuration for a consumer process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Base URL of the broker, e.g. `http://127.0.0.1:5801`
    pub broker_url: String,
    /// URL under which the broker can reach this consumer's receive endpoint
    pub consumer_url: String,
    /// Address the consumer HTTP server binds to (default: 0.0.0.0:5800)
    #[serde(default = "default_consumer_listen_address")]
    pub listen_address: String,
}

impl ConsumerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.broker_url.is_empty() || self.consumer_url.is_empty() {
            return Err(OrchestratorError::Config(
                "Consumer broker_url and consumer_url must be set".to_string(),
            )
            .into());
        }
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            OrchestratorError::Config(format!(
                "Invalid consumer listen address '{}': {}",
                self.listen_address, e
            ))
        })?;
        Ok(())
    }
}

/// Configuration shared by monitors and alert sinks.
///
/// The UI base URL, when set, turns task and run ids in alert messages into
/// links to the corresponding detail pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default)]
    pub ui_base_url: Option<String>,
}
