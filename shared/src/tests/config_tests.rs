//! Tests for configuration types and validation

use crate::config::{
    load_config_file, BrokerConfig, ConsumerConfig, ModuleConfig, RunnerConfig, SchedulerConfig,
    StoreConfig,
};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_scheduler_config_defaults() {
    let config = SchedulerConfig::default();

    assert_eq!(config.task_refresh_interval_seconds, 60);
    assert_eq!(config.poll_interval_seconds, 15);
    assert!(config.fail_unstarted_runs);
    assert!(config.disable_stale_tasks);
    assert_eq!(config.prune_runs_max_age_days, Some(180));
    assert_eq!(config.prune_interval_seconds, 3600);
    assert_eq!(config.fail_historical_age_hours, Some(24));
    assert!(config.validate().is_ok());
}

#[test]
fn test_scheduler_config_age_conversion() {
    let config = SchedulerConfig {
        prune_runs_max_age_days: Some(2),
        fail_historical_age_hours: Some(3),
        prune_logs_max_age_days: None,
        ..SchedulerConfig::default()
    };

    assert_eq!(
        config.prune_runs_max_age(),
        Some(Duration::from_secs(2 * 86_400))
    );
    assert_eq!(
        config.fail_historical_age(),
        Some(Duration::from_secs(3 * 3_600))
    );
    assert_eq!(config.prune_logs_max_age(), None);
}

#[test]
fn test_scheduler_config_rejects_zero_intervals() {
    let config = SchedulerConfig {
        poll_interval_seconds: 0,
        ..SchedulerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_from_toml_with_partial_fields() {
    let toml_str = r#"
        task_refresh_interval_seconds = 10
        prune_runs_max_age_days = 30
    "#;
    let config: SchedulerConfig = toml::from_str(toml_str).unwrap();

    assert_eq!(config.task_refresh_interval_seconds, 10);
    assert_eq!(config.prune_runs_max_age_days, Some(30));
    // Unspecified fields fall back to the defaults
    assert_eq!(config.poll_interval_seconds, 15);
    assert!(config.fail_historical_runs);
}

#[test]
fn test_runner_config_defaults() {
    let config = RunnerConfig::default();

    assert!(config.use_thread_groups);
    assert!(config.spawn_workers);
    assert_eq!(config.poll_interval_seconds, 15);
    assert_eq!(config.heartbeat_interval_seconds, 15);
    assert_eq!(config.default_timeout_seconds, 1800);
    assert!(config.validate().is_ok());
}

#[test]
fn test_runner_config_rejects_zero_timeout() {
    let config = RunnerConfig {
        default_timeout_seconds: 0,
        ..RunnerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_module_config_defaults() {
    let config = ModuleConfig::default();
    assert_eq!(config.max_retries, 1);
    assert_eq!(config.retry_interval_seconds, 10);
}

#[test]
fn test_broker_config_validation() {
    let config = BrokerConfig {
        listen_address: "127.0.0.1:5801".to_string(),
        store: StoreConfig::new("/tmp/broker"),
        delivery_timeout_seconds: 5,
    };
    assert!(config.validate().is_ok());

    let bad = BrokerConfig {
        listen_address: "not-an-address".to_string(),
        ..config
    };
    assert!(bad.validate().is_err());
}

#[test]
fn test_broker_config_from_toml() {
    let toml_str = r#"
        [store]
        data_dir = "/var/lib/mqueue"
    "#;
    let config: BrokerConfig = toml::from_str(toml_str).unwrap();

    assert_eq!(config.listen_address, "127.0.0.1:5801");
    assert_eq!(config.delivery_timeout_seconds, 5);
    assert_eq!(config.store.busy_timeout_seconds, 5);
}

#[test]
fn test_load_config_file_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broker.toml");
    std::fs::write(
        &config_path,
        r#"
            listen_address = "127.0.0.1:6900"

            [store]
            data_dir = "/var/lib/mqueue"
            busy_timeout_seconds = 10
        "#,
    )
    .unwrap();

    let config: BrokerConfig = load_config_file(&config_path).unwrap();
    assert_eq!(config.listen_address, "127.0.0.1:6900");
    assert_eq!(config.store.busy_timeout_seconds, 10);
    // Unspecified fields fall back to the defaults
    assert_eq!(config.delivery_timeout_seconds, 5);
}

#[test]
fn test_load_config_file_errors_name_the_file() {
    let temp_dir = TempDir::new().unwrap();

    let missing = temp_dir.path().join("missing.toml");
    let error = load_config_file::<BrokerConfig>(&missing).unwrap_err();
    assert!(format!("{error:#}").contains("missing.toml"));

    let malformed = temp_dir.path().join("broker.toml");
    std::fs::write(&malformed, "not = [valid").unwrap();
    let error = load_config_file::<BrokerConfig>(&malformed).unwrap_err();
    assert!(format!("{error:#}").contains("broker.toml"));
}

#[test]
fn test_consumer_config_validation() {
    let config = ConsumerConfig {
        broker_url: "http://127.0.0.1:5801".to_string(),
        consumer_url: "http://127.0.0.1:5800/receive-message".to_string(),
        listen_address: "0.0.0.0:5800".to_string(),
    };
    assert!(config.validate().is_ok());

    let bad = ConsumerConfig {
        broker_url: String::new(),
        ..config
    };
    assert!(bad.validate().is_err());
}
