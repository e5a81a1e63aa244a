//! Shared data structures and utilities for the task orchestration system
//!
//! This crate contains common types, configuration structures, broker API
//! types and utilities used by both the orchestrator and the message queue
//! components.

pub mod api;
pub mod config;
pub mod defaults;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types for convenience
pub use config::{BrokerConfig, ModuleConfig, RunnerConfig, SchedulerConfig, StoreConfig};
pub use utils::{merge_output, message_id, now_millis, now_seconds};

/// Result type alias used throughout the workspace
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the orchestration system
///
/// Variants map to the error kinds that callers need to tell apart: an
/// uninitialised store must not look like a transient database failure, and
/// a refused state transition must not look like a bug in the caller's task
/// function.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestrator not initialised: {0}")]
    NotInitialised(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid run state transition: {0}")]
    InvalidTransition(String),

    #[error("Run timed out: {0}")]
    Timeout(String),

    #[error("Module execution failed: {0}")]
    Module(String),

    #[error("Broker delivery failed: {0}")]
    Broker(String),

    #[error("Message decode failed: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl OrchestratorError {
    /// True when the error is a refused run state transition.
    ///
    /// The task runner uses this to treat `set_success` on an already
    /// warned run as a quiet no-op while still surfacing genuine logic bugs.
    pub fn is_invalid_transition(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::InvalidTransition(_))
        )
    }

    /// True when the error indicates the store was used before
    /// `initialize()` completed.
    pub fn is_not_initialised(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::NotInitialised(_))
        )
    }
}
