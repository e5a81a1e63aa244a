//! Tests for the module retry wrapper and run context

use crate::modules::{invoke, Module, ModuleKind, RunContext};
use shared::config::ModuleConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn fast_retries(max_retries: u32) -> ModuleConfig {
    ModuleConfig {
        max_retries,
        retry_interval_seconds: 0,
    }
}

fn test_module() -> Module {
    Module::new("extract_orders", "reads the orders table", ModuleKind::Source)
}

#[tokio::test]
async fn test_successful_invoke_records_one_entry() {
    let context = RunContext::new("r1", 60);

    let result = invoke(&context, &test_module(), &fast_retries(1), || async {
        Ok(7)
    })
    .await
    .unwrap();
    assert_eq!(result, 7);

    let run_times = context.run_times();
    assert_eq!(run_times.len(), 1);
    assert_eq!(run_times[0].module_id, "extract_orders");
    assert_eq!(run_times[0].retry_count, 0);
    assert!(run_times[0].retry_exceptions.is_empty());
    assert!(run_times[0].duration_seconds >= 0.0);
}

#[tokio::test]
async fn test_retry_records_one_entry_per_attempt() {
    let context = RunContext::new("r1", 60);
    let attempts = Arc::new(AtomicU32::new(0));

    // Fails twice, succeeds on the third attempt.
    let result = invoke(&context, &test_module(), &fast_retries(2), || {
        let attempts = Arc::clone(&attempts);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                Ok("data")
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(result, "data");

    // k retries means k+1 entries with retry_count 0..k.
    let run_times = context.run_times();
    assert_eq!(run_times.len(), 3);
    let counts: Vec<u32> = run_times.iter().map(|entry| entry.retry_count).collect();
    assert_eq!(counts, vec![0, 1, 2]);
    // The final entry carries the exceptions from the failed attempts.
    assert_eq!(run_times[2].retry_exceptions.len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_compose_the_error() {
    let context = RunContext::new("r1", 60);

    let result: anyhow::Result<()> =
        invoke(&context, &test_module(), &fast_retries(1), || async {
            Err(anyhow::anyhow!("disk full"))
        })
        .await;

    let error = format!("{:#}", result.unwrap_err());
    assert!(error.contains("extract_orders"));
    assert!(error.contains("disk full"));
    assert!(error.contains("total attempts: 2"));

    // Both attempts still left timing entries behind.
    assert_eq!(context.run_times().len(), 2);
}

#[tokio::test]
async fn test_clear_run_times_resets_telemetry() {
    let context = RunContext::new("r1", 60);
    invoke(&context, &test_module(), &fast_retries(0), || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(context.run_times().len(), 1);

    context.clear_run_times();
    assert!(context.run_times().is_empty());
}

#[test]
fn test_timeout_budget_ticks_down_and_expires() {
    let context = RunContext::new("r1", 3);

    assert_eq!(context.timeout_remaining(), 3);
    assert_eq!(context.tick_down(1), 2);
    assert_eq!(context.tick_down(1), 1);

    // Expiry (used by cancellation) zeroes whatever budget is left.
    context.expire_timeout();
    assert_eq!(context.timeout_remaining(), 0);
    assert!(context.tick_down(1) <= 0);
}
