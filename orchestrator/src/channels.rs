//! Message queue channels published by the orchestrator

use mqueue::Channel;
use serde::{Deserialize, Serialize};

/// Payload published whenever a run reaches the `failed` state.
///
/// The run row is committed before this message is sent, so a consumer can
/// always load the run by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailedMessage {
    pub task_id: String,
    pub run_id: String,
}

/// Channel carrying [`RunFailedMessage`]s to monitors.
pub const RUN_FAILED: Channel<RunFailedMessage> = Channel::new("run_failed");
