use serde::{Deserialize, Serialize};

/// Lifecycle state of one run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Passed,
    Failed,
    Stopped,
    Errored,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Stopped | Self::Errored
        )
    }

    /// Outcome status reported to sinks; `None` while the run is in flight.
    pub fn outcome_status(self) -> Option<OutcomeStatus> {
        match self {
            Self::Pending | Self::Running => None,
            Self::Passed => Some(OutcomeStatus::Passed),
            Self::Failed => Some(OutcomeStatus::Failed),
            Self::Stopped => Some(OutcomeStatus::Stopped),
            Self::Errored => Some(OutcomeStatus::Errored),
        }
    }
}

/// Terminal result of a run. Set at most once.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub steps_executed: u32,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Passed,
    Failed,
    Stopped,
    Errored,
}

/// Result payload of a `testFinished` event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub status: OutcomeStatus,
    pub steps_executed: u32,
    pub errors: Vec<String>,
}

/// How an agent process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentExit {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Exit status could not be collected.
    Lost { message: String },
}

/// SIGTERM and SIGKILL numbers, fixed across the unix platforms we target.
pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;

impl AgentExit {
    pub fn code(code: i32) -> Self {
        Self::Exited {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self::Exited {
            code: None,
            signal: Some(signal),
        }
    }

    /// True when the process was ended by a stop or kill signal.
    pub fn terminated_by_stop_signal(&self) -> bool {
        matches!(
            self,
            Self::Exited {
                signal: Some(SIGTERM | SIGKILL),
                ..
            }
        )
    }
}

impl From<std::process::ExitStatus> for AgentExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self::Exited {
            code: status.code(),
            signal,
        }
    }
}
