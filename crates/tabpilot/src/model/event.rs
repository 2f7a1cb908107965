//! Messages exchanged with the outside world.
//!
//! [`SinkEvent`] is the one-way outbound stream; [`Command`] is the closed set
//! of inbound requests. Both serialize as `{"type": ..., ...}` /
//! `{"command": ..., ...}` objects with camelCase fields.

use crate::model::{TargetId, TestId, TestOutcome};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Output channel of an agent process.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Stdout,
    Stderr,
}

/// Phase reported by a `stepUpdate` event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepPhase {
    Started,
    Passed,
    Failed,
    Verifying,
    VerifyPassed,
    VerifyFailed,
}

/// Kind of a display-only `statusUpdate` message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StatusKind {
    Progress,
    Bug,
    NewTab,
    Output,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SinkEvent {
    #[serde(rename_all = "camelCase")]
    Connected { folder_name: Option<String> },
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    TestStarted {
        test_id: TestId,
        test_name: String,
        url: Option<String>,
        target_id: TargetId,
        total_steps: u32,
    },
    #[serde(rename_all = "camelCase")]
    StepUpdate {
        test_id: TestId,
        step_number: u32,
        status: StepPhase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        test_id: TestId,
        message: String,
        kind: StatusKind,
    },
    #[serde(rename_all = "camelCase")]
    LogMessage {
        test_id: TestId,
        channel: LogChannel,
        text: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Screenshot {
        test_id: TestId,
        data: String,
        timestamp: u64,
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TestFinished {
        test_id: TestId,
        result: TestOutcome,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Logs {
        test_id: TestId,
        stdout: String,
        stderr: String,
        bugs: Vec<String>,
    },
    TabsCleared,
}

impl SinkEvent {
    /// Test the event belongs to, if it is run-scoped.
    pub fn test_id(&self) -> Option<&TestId> {
        match self {
            Self::TestStarted { test_id, .. }
            | Self::StepUpdate { test_id, .. }
            | Self::StatusUpdate { test_id, .. }
            | Self::LogMessage { test_id, .. }
            | Self::Screenshot { test_id, .. }
            | Self::TestFinished { test_id, .. }
            | Self::Logs { test_id, .. } => Some(test_id),
            Self::Connected { .. } | Self::Error { .. } | Self::TabsCleared => None,
        }
    }
}

/// Inbound request from a UI or the CLI's stdin.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Ready,
    #[serde(rename_all = "camelCase")]
    StopTest { test_id: TestId },
    StopAll,
    #[serde(rename_all = "camelCase")]
    ViewLogs { test_id: TestId },
    ClearTabs,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}
