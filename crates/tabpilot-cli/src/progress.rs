//! Human-readable rendering of coordinator events using indicatif.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tabpilot::model::{OutcomeStatus, SinkEvent, StatusKind, StepPhase, TestId, TestOutcome};

/// One progress bar per running test, with finished tests printed as lines
/// on stderr so stdout stays free for `--json`.
pub struct ProgressRenderer {
    multi: MultiProgress,
    bars: HashMap<TestId, ProgressBar>,
    names: HashMap<TestId, String>,
    color: bool,
    verbose: bool,
}

impl ProgressRenderer {
    pub fn new(color: bool, verbose: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            names: HashMap::new(),
            color,
            verbose,
        }
    }

    pub fn render(&mut self, event: &SinkEvent) {
        match event {
            SinkEvent::Connected { folder_name } => {
                let folder = folder_name.as_deref().unwrap_or("tests");
                self.line(&format!("connected, running {folder}"));
            }
            SinkEvent::Error { message } => {
                let label = self.paint("31", "error");
                self.line(&format!("{label}: {message}"));
            }
            SinkEvent::TestStarted {
                test_id,
                test_name,
                total_steps,
                ..
            } => {
                let bar = self.multi.add(ProgressBar::new(u64::from(*total_steps)));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.cyan} {prefix:.bold} [{bar:20}] {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_prefix(test_name.clone());
                bar.enable_steady_tick(Duration::from_millis(100));
                self.names.insert(test_id.clone(), test_name.clone());
                self.bars.insert(test_id.clone(), bar);
            }
            SinkEvent::StepUpdate {
                test_id,
                step_number,
                status,
                message,
                ..
            } => {
                if let Some(bar) = self.bars.get(test_id) {
                    if matches!(status, StepPhase::Passed) {
                        bar.set_position(u64::from(*step_number));
                    }
                    bar.set_message(message.clone());
                }
                if self.verbose {
                    let name = self.name(test_id);
                    self.line(&format!("  {name}: {message}"));
                }
            }
            SinkEvent::StatusUpdate {
                test_id,
                message,
                kind,
            } => {
                if let Some(bar) = self.bars.get(test_id) {
                    bar.set_message(message.clone());
                }
                if matches!(kind, StatusKind::Bug) || self.verbose {
                    let name = self.name(test_id);
                    self.line(&format!("  {name}: {message}"));
                }
            }
            SinkEvent::TestFinished {
                test_id,
                result,
                duration_ms,
            } => {
                if let Some(bar) = self.bars.remove(test_id) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                let name = self.name(test_id);
                self.finished(&name, result, *duration_ms);
            }
            SinkEvent::Logs {
                test_id,
                stdout,
                stderr,
                bugs,
            } => {
                let name = self.name(test_id);
                self.line(&format!("--- {name} stdout ---\n{stdout}"));
                self.line(&format!("--- {name} stderr ---\n{stderr}"));
                for bug in bugs {
                    self.line(&format!("bug: {bug}"));
                }
            }
            SinkEvent::TabsCleared => {
                for (_, bar) in self.bars.drain() {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                self.line("tabs cleared");
            }
            SinkEvent::LogMessage { .. } | SinkEvent::Screenshot { .. } => {}
        }
    }

    /// Clear any bars left over (e.g. runs that never finished).
    pub fn finish(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        self.multi.clear().ok();
    }

    fn finished(&self, name: &str, result: &TestOutcome, duration_ms: u64) {
        let icon = match result.status {
            OutcomeStatus::Passed => self.paint("32", "✓"),
            OutcomeStatus::Failed => self.paint("31", "✗"),
            OutcomeStatus::Errored => self.paint("31", "!"),
            OutcomeStatus::Stopped => self.paint("33", "-"),
        };
        let status = status_label(result.status);
        self.line(&format!(
            "{icon} {name} {status} ({} steps, {duration_ms}ms)",
            result.steps_executed
        ));
        for error in &result.errors {
            self.line(&format!("    {error}"));
        }
    }

    fn name(&self, test_id: &TestId) -> String {
        self.names
            .get(test_id)
            .cloned()
            .unwrap_or_else(|| test_id.to_string())
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    // Bars are hidden when stderr is not a terminal; suspend still writes.
    fn line(&self, text: &str) {
        self.multi.suspend(|| {
            let _ = writeln!(std::io::stderr(), "{text}");
        });
    }
}

pub fn status_label(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Passed => "passed",
        OutcomeStatus::Failed => "failed",
        OutcomeStatus::Stopped => "stopped",
        OutcomeStatus::Errored => "errored",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_wire_names() {
        for status in [
            OutcomeStatus::Passed,
            OutcomeStatus::Failed,
            OutcomeStatus::Stopped,
            OutcomeStatus::Errored,
        ] {
            let wire = serde_json::to_value(status).ok();
            assert_eq!(wire, Some(serde_json::Value::from(status_label(status))));
        }
    }

    #[test]
    fn finished_runs_drop_their_bar() {
        let mut renderer = ProgressRenderer::new(false, false);
        let test_id = TestId::from("a");
        renderer.render(&SinkEvent::TestStarted {
            test_id: test_id.clone(),
            test_name: "A".to_string(),
            url: None,
            target_id: tabpilot::model::TargetId::new("t1"),
            total_steps: 2,
        });
        assert_eq!(renderer.bars.len(), 1);
        renderer.render(&SinkEvent::TestFinished {
            test_id,
            result: TestOutcome {
                status: OutcomeStatus::Passed,
                steps_executed: 2,
                errors: Vec::new(),
            },
            duration_ms: 10,
        });
        assert!(renderer.bars.is_empty());
        renderer.finish();
    }
}
