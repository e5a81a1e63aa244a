//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Store defaults

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

// Scheduler defaults

/// Default interval between task cache refreshes from the store (60 seconds)
pub fn default_task_refresh_interval() -> u64 {
    60
}

/// Default due-detection poll tick (15 seconds)
pub fn default_schedule_poll_interval() -> u64 {
    15
}

/// Default age after which runs are pruned (180 days)
pub fn default_prune_runs_max_age_days() -> Option<u32> {
    Some(180)
}

/// Default age after which log entries are pruned (180 days)
pub fn default_prune_logs_max_age_days() -> Option<u32> {
    Some(180)
}

/// Default interval between prune passes (1 hour)
pub fn default_prune_interval() -> u64 {
    3600
}

/// Default age after which open runs are failed as historical (24 hours)
pub fn default_fail_historical_age_hours() -> Option<u32> {
    Some(24)
}

/// Default interval between historical-failer passes (1 hour)
pub fn default_fail_historical_interval() -> u64 {
    3600
}

/// Whether unstarted previous runs are failed when a new run is due
pub fn default_true() -> bool {
    true
}

// Runner defaults

/// Default worker loop poll tick (15 seconds)
pub fn default_runner_poll_interval() -> u64 {
    15
}

/// Default run liveness heartbeat interval (15 seconds)
pub fn default_heartbeat_interval() -> u64 {
    15
}

/// Default run timeout unless overridden by the schedule config (30 minutes)
pub fn default_run_timeout() -> u64 {
    1800
}

// Module defaults

/// Default maximum retries for a module operation (1 retry, 2 attempts total)
pub fn default_module_max_retries() -> u32 {
    1
}

/// Default wait between module retry attempts (10 seconds)
pub fn default_module_retry_interval() -> u64 {
    10
}

// Broker defaults

/// Default broker listen address
pub fn default_broker_listen_address() -> String {
    "127.0.0.1:5801".to_string()
}

/// Default consumer listen address
pub fn default_consumer_listen_address() -> String {
    "0.0.0.0:5800".to_string()
}

/// Default timeout for broker-to-consumer delivery POSTs (5 seconds)
pub fn default_delivery_timeout() -> u64 {
    5
}
