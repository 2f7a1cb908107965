//! Per-run state machine.
//!
//! [`RunExecution`] tracks one test's lifecycle, progress and log buffers.
//! It performs no I/O: every mutation returns the [`SinkEvent`]s it derives
//! and the coordinator decides where they go.

use crate::model::{
    timestamp_ms, AgentExit, LogChannel, RunId, RunResult, RunState, SinkEvent, StatusKind,
    StepPhase, TargetId, TestDefinition, TestId, TestOutcome,
};
use crate::parser::{parse_bug_reports, LogEvent, StepStatus, VerificationStatus};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

const VERIFICATION_FAILED: &str = "Verification failed";

#[derive(Clone, Debug)]
pub struct RunExecution {
    test_id: TestId,
    run_id: RunId,
    test_name: String,
    url: Option<String>,
    total_steps: u32,
    state: RunState,
    started_at: Instant,
    start_time_ms: u64,
    end_time_ms: Option<u64>,
    current_step: u32,
    verified_steps: BTreeSet<u32>,
    completed_steps: BTreeSet<u32>,
    step_errors: Vec<String>,
    stdout: String,
    stderr: String,
    bugs: Vec<String>,
    target_id: Option<TargetId>,
    is_running: bool,
    stop_requested: bool,
    result: Option<RunResult>,
}

impl RunExecution {
    pub fn new(test: &TestDefinition, run_id: RunId) -> Self {
        Self {
            test_id: test.id.clone(),
            run_id,
            test_name: test.name.clone(),
            url: test.url.clone(),
            total_steps: test.total_steps(),
            state: RunState::Pending,
            started_at: Instant::now(),
            start_time_ms: timestamp_ms(),
            end_time_ms: None,
            current_step: 0,
            verified_steps: BTreeSet::new(),
            completed_steps: BTreeSet::new(),
            step_errors: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            bugs: Vec::new(),
            target_id: None,
            is_running: false,
            stop_requested: false,
            result: None,
        }
    }

    pub fn test_id(&self) -> &TestId {
        &self.test_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn result(&self) -> Option<&RunResult> {
        self.result.as_ref()
    }

    /// Outcome as reported in `testFinished`; `None` until terminal.
    pub fn outcome(&self) -> Option<TestOutcome> {
        let status = self.state.outcome_status()?;
        let result = self.result.as_ref()?;
        Some(TestOutcome {
            status,
            steps_executed: result.steps_executed,
            errors: result.errors.clone(),
        })
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn verified_steps(&self) -> &BTreeSet<u32> {
        &self.verified_steps
    }

    pub fn completed_steps(&self) -> &BTreeSet<u32> {
        &self.completed_steps
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn bugs(&self) -> &[String] {
        &self.bugs
    }

    pub fn target_id(&self) -> Option<&TargetId> {
        self.target_id.as_ref()
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> Option<u64> {
        self.end_time_ms
    }

    /// True while the agent process is alive.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Tab attached and process spawned.
    pub fn mark_running(&mut self, target_id: TargetId) -> SinkEvent {
        self.state = RunState::Running;
        self.is_running = true;
        self.target_id = Some(target_id.clone());
        SinkEvent::TestStarted {
            test_id: self.test_id.clone(),
            test_name: self.test_name.clone(),
            url: self.url.clone(),
            target_id,
            total_steps: self.total_steps,
        }
    }

    /// Launch failed before the run reached `Running`.
    pub fn mark_errored(&mut self, message: impl Into<String>) -> Option<SinkEvent> {
        self.is_running = false;
        self.conclude(
            RunState::Errored,
            RunResult {
                success: false,
                steps_executed: 0,
                errors: vec![message.into()],
            },
        )
    }

    /// Flag a user stop. Returns false when there is nothing to stop.
    pub fn request_stop(&mut self) -> bool {
        if !self.is_running || self.stop_requested {
            return false;
        }
        self.stop_requested = true;
        true
    }

    /// Append raw process output to the run's buffers.
    pub fn record_output(&mut self, channel: LogChannel, text: &str) -> SinkEvent {
        match channel {
            LogChannel::Stdout => self.stdout.push_str(text),
            LogChannel::Stderr => self.stderr.push_str(text),
        }
        SinkEvent::LogMessage {
            test_id: self.test_id.clone(),
            channel,
            text: text.to_string(),
            timestamp: timestamp_ms(),
        }
    }

    pub fn apply(&mut self, event: &LogEvent) -> Vec<SinkEvent> {
        match event {
            LogEvent::Step {
                step,
                action,
                status,
                error,
            } => {
                let phase = match status {
                    StepStatus::Started => {
                        self.current_step = *step;
                        StepPhase::Started
                    }
                    StepStatus::Passed => {
                        self.completed_steps.insert(*step);
                        StepPhase::Passed
                    }
                    StepStatus::Failed => {
                        self.completed_steps.insert(*step);
                        if let Some(error) = error {
                            self.step_errors.push(error.clone());
                        }
                        StepPhase::Failed
                    }
                };
                vec![self.step_update(*step, phase, event, action.clone(), error.clone())]
            }
            LogEvent::Verification {
                step,
                status,
                error,
                ..
            } => match status {
                VerificationStatus::Verifying => {
                    vec![self.step_update(*step, StepPhase::Verifying, event, None, None)]
                }
                VerificationStatus::VerifyPassed => {
                    self.verified_steps.insert(*step);
                    vec![self.step_update(*step, StepPhase::VerifyPassed, event, None, None)]
                }
                VerificationStatus::VerifyFailed => {
                    if let Some(error) = error {
                        self.step_errors.push(error.clone());
                    }
                    let mut events = vec![self.step_update(
                        *step,
                        StepPhase::VerifyFailed,
                        event,
                        None,
                        error.clone(),
                    )];
                    // A pending stop decides the outcome once the process exits.
                    if self.stop_requested {
                        return events;
                    }
                    let message = error
                        .clone()
                        .unwrap_or_else(|| VERIFICATION_FAILED.to_string());
                    events.extend(self.conclude(
                        RunState::Failed,
                        RunResult {
                            success: false,
                            steps_executed: *step,
                            errors: vec![message],
                        },
                    ));
                    events
                }
            },
            LogEvent::Bug { message } => {
                self.bugs.push(message.clone());
                vec![self.status_update(event, StatusKind::Bug)]
            }
            LogEvent::NewTab { .. } => vec![self.status_update(event, StatusKind::NewTab)],
            LogEvent::Other { .. } => vec![self.status_update(event, StatusKind::Output)],
            LogEvent::Locating { .. }
            | LogEvent::ReIdentifying { .. }
            | LogEvent::Code { .. }
            | LogEvent::Abstracting { .. }
            | LogEvent::ProposingAction { .. } => {
                vec![self.status_update(event, StatusKind::Progress)]
            }
        }
    }

    /// Process exit. Returns `testFinished` unless the run was already
    /// concluded (e.g. by a verification failure).
    pub fn finish(&mut self, exit: &AgentExit) -> Option<SinkEvent> {
        self.is_running = false;
        if self.state.is_terminal() {
            return None;
        }
        let steps_executed = self.steps_executed();
        let (state, result) = match exit {
            _ if self.stop_requested || exit.terminated_by_stop_signal() => (
                RunState::Stopped,
                RunResult {
                    success: false,
                    steps_executed,
                    errors: Vec::new(),
                },
            ),
            AgentExit::Exited { code: Some(0), .. } => (
                RunState::Passed,
                RunResult {
                    success: true,
                    steps_executed,
                    errors: Vec::new(),
                },
            ),
            AgentExit::Exited { code, signal } => (
                RunState::Failed,
                RunResult {
                    success: false,
                    steps_executed,
                    errors: self.failure_errors(*code, *signal),
                },
            ),
            AgentExit::Lost { message } => (
                RunState::Failed,
                RunResult {
                    success: false,
                    steps_executed,
                    errors: vec![message.clone()],
                },
            ),
        };
        self.conclude(state, result)
    }

    pub fn logs(&self) -> SinkEvent {
        SinkEvent::Logs {
            test_id: self.test_id.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            bugs: self.bugs.clone(),
        }
    }

    fn steps_executed(&self) -> u32 {
        let completed = u32::try_from(self.completed_steps.len()).unwrap_or(u32::MAX);
        completed.max(self.current_step)
    }

    fn failure_errors(&self, code: Option<i32>, signal: Option<i32>) -> Vec<String> {
        let bugs = parse_bug_reports(&self.stdout);
        if !bugs.is_empty() {
            return bugs;
        }
        if !self.step_errors.is_empty() {
            return self.step_errors.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return vec![stderr.to_string()];
        }
        let reason = match (code, signal) {
            (Some(code), _) => format!("Process exited with code {code}"),
            (None, Some(signal)) => format!("Process killed by signal {signal}"),
            (None, None) => "Process exited without a status".to_string(),
        };
        vec![reason]
    }

    fn conclude(&mut self, state: RunState, result: RunResult) -> Option<SinkEvent> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = state;
        self.result = Some(result);
        self.end_time_ms = Some(timestamp_ms());
        let outcome = self.outcome()?;
        Some(SinkEvent::TestFinished {
            test_id: self.test_id.clone(),
            result: outcome,
            duration_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn step_update(
        &self,
        step: u32,
        status: StepPhase,
        event: &LogEvent,
        action: Option<String>,
        error: Option<String>,
    ) -> SinkEvent {
        SinkEvent::StepUpdate {
            test_id: self.test_id.clone(),
            step_number: step,
            status,
            message: event.display_message(),
            action,
            error,
        }
    }

    fn status_update(&self, event: &LogEvent, kind: StatusKind) -> SinkEvent {
        SinkEvent::StatusUpdate {
            test_id: self.test_id.clone(),
            message: event.display_message(),
            kind,
        }
    }
}
