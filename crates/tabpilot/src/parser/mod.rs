//! Agent log decoding.
//!
//! Test agents report progress as plain text on stdout/stderr. This module
//! turns one chunk of that text into an ordered list of [`LogEvent`]s.
//!
//! Two rules shape the decoder:
//!
//! - A handful of sentinel phrases mark multi-line output (proposed code,
//!   page abstraction, ...). If a chunk contains one anywhere, the whole chunk
//!   becomes a single event and no per-line matching happens.
//! - Per-line patterns are tried in a fixed order and the first match wins.
//!   `VERIFYING_STEP_` forms come before `STEP_` forms because the latter is a
//!   substring of the former.
//!
//! Every function here is pure; calling it concurrently from many runs is
//! safe.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const PROPOSED_CODE: &str = "Proposed code:";
const ABSTRACTING_PAGE: &str = "Abstracting page...";
const REASONING_NEXT_ACTION: &str = "Reasoning next action...";
const CHECKING_REIDENTIFICATION: &str = "Checking page re-identification";
const BUG_PREFIX: &str = "Bug reported:";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Started,
    Passed,
    Failed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VerificationStatus {
    Verifying,
    VerifyPassed,
    VerifyFailed,
}

/// One decoded agent log event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LogEvent {
    Step {
        step: u32,
        action: Option<String>,
        status: StepStatus,
        error: Option<String>,
    },
    Verification {
        step: u32,
        expectation: Option<String>,
        status: VerificationStatus,
        error: Option<String>,
    },
    Bug {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    NewTab {
        target_id: String,
    },
    Locating {
        raw: String,
    },
    ReIdentifying {
        raw: String,
    },
    Code {
        raw: String,
    },
    Abstracting {
        raw: String,
    },
    ProposingAction {
        raw: String,
    },
    Other {
        raw: String,
    },
}

impl LogEvent {
    /// Human-readable progress text for this event.
    pub fn display_message(&self) -> String {
        match self {
            Self::Step {
                step,
                action,
                status,
                error,
            } => match status {
                StepStatus::Started => {
                    format!("Step {step}: {}", action.as_deref().unwrap_or_default())
                }
                StepStatus::Passed => format!("Step {step} passed"),
                StepStatus::Failed => format!(
                    "Step {step} failed: {}",
                    error.as_deref().unwrap_or("error")
                ),
            },
            Self::Verification {
                step,
                expectation,
                status,
                error,
            } => match status {
                VerificationStatus::Verifying => format!(
                    "Step {step}: Verifying - {}",
                    expectation.as_deref().unwrap_or_default()
                ),
                VerificationStatus::VerifyPassed => {
                    format!("Step {step} verification passed")
                }
                VerificationStatus::VerifyFailed => format!(
                    "Step {step} verification failed: {}",
                    error.as_deref().unwrap_or("verification failed")
                ),
            },
            Self::Bug { message } => format!("{BUG_PREFIX} {message}"),
            Self::NewTab { target_id } => format!("New tab opened: {target_id}"),
            Self::ReIdentifying { .. } => format!("{CHECKING_REIDENTIFICATION}..."),
            Self::Code { raw } => format!("Executing proposed code, {raw}"),
            Self::ProposingAction { .. } => REASONING_NEXT_ACTION.to_string(),
            Self::Locating { raw } | Self::Abstracting { raw } | Self::Other { raw } => {
                raw.clone()
            }
        }
    }
}

/// Which matcher the coordinator feeds chunks through.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Unmatched lines are dropped.
    #[default]
    Rich,
    /// Unmatched lines are kept as [`LogEvent::Other`].
    Basic,
}

impl ParseMode {
    pub fn parse(self, chunk: &str) -> Vec<LogEvent> {
        match self {
            Self::Rich => parse_log_events(chunk),
            Self::Basic => parse_log_events_basic(chunk),
        }
    }
}

/// Decode a chunk, dropping lines that match no pattern.
pub fn parse_log_events(chunk: &str) -> Vec<LogEvent> {
    parse_chunk(chunk, false)
}

/// Decode a chunk, keeping unmatched lines as [`LogEvent::Other`].
pub fn parse_log_events_basic(chunk: &str) -> Vec<LogEvent> {
    parse_chunk(chunk, true)
}

/// Collect every `Bug reported: <message>` in `text`, in order.
pub fn parse_bug_reports(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_once(BUG_PREFIX).map(|(_, rest)| rest.trim()))
        .filter(|message| !message.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_chunk(chunk: &str, keep_unmatched: bool) -> Vec<LogEvent> {
    if chunk.is_empty() {
        return Vec::new();
    }
    if let Some(event) = chunk_sentinel(chunk) {
        return vec![event];
    }

    let mut events = Vec::new();
    for line in chunk.lines().filter(|line| !line.is_empty()) {
        match match_line(line) {
            LineMatch::Event(event) => events.push(event),
            LineMatch::Malformed => {}
            LineMatch::Unmatched => {
                if keep_unmatched {
                    events.push(LogEvent::Other {
                        raw: line.to_string(),
                    });
                }
            }
        }
    }
    events
}

fn chunk_sentinel(chunk: &str) -> Option<LogEvent> {
    if let Some((_, code)) = chunk.split_once(PROPOSED_CODE) {
        return Some(LogEvent::Code {
            raw: code.trim().to_string(),
        });
    }
    if chunk.contains(ABSTRACTING_PAGE) {
        return Some(LogEvent::Abstracting {
            raw: ABSTRACTING_PAGE.to_string(),
        });
    }
    if chunk.contains(REASONING_NEXT_ACTION) {
        return Some(LogEvent::ProposingAction {
            raw: REASONING_NEXT_ACTION.to_string(),
        });
    }
    if chunk.contains(CHECKING_REIDENTIFICATION) {
        return Some(LogEvent::ReIdentifying {
            raw: CHECKING_REIDENTIFICATION.to_string(),
        });
    }
    None
}

enum LineMatch {
    Event(LogEvent),
    /// A pattern matched but its step number did not parse.
    Malformed,
    Unmatched,
}

#[derive(Clone, Copy)]
enum LinePattern {
    Verifying,
    VerifyPassed,
    VerifyFailed,
    StepStarted,
    StepPassed,
    StepFailed,
    Locating,
    Bug,
    NewTab,
}

// Order is load-bearing: verification forms must precede step forms.
static LINE_PATTERNS: LazyLock<Vec<(LinePattern, Regex)>> = LazyLock::new(|| {
    [
        (LinePattern::Verifying, r"VERIFYING_STEP_(\d+):\s*(.+)"),
        (LinePattern::VerifyPassed, r"VERIFYING_STEP_(\d+)_PASSED"),
        (LinePattern::VerifyFailed, r"VERIFYING_STEP_(\d+)_FAILED:\s*(.+)"),
        (LinePattern::StepStarted, r"STEP_(\d+):\s*(.+)"),
        (LinePattern::StepPassed, r"STEP_(\d+)_PASSED"),
        (LinePattern::StepFailed, r"STEP_(\d+)_FAILED:\s*(.+)"),
        (LinePattern::Locating, r#"Locating element to click:\s*"(.+)""#),
        (LinePattern::Bug, r"Bug reported:\s*(.+)$"),
        (LinePattern::NewTab, r"NEW_TAB_OPENED:\s*(.+)$"),
    ]
    .into_iter()
    .map(|(pattern, source)| {
        #[allow(clippy::expect_used)]
        let regex = Regex::new(source).expect("line patterns are valid");
        (pattern, regex)
    })
    .collect()
});

fn match_line(line: &str) -> LineMatch {
    for (pattern, regex) in LINE_PATTERNS.iter() {
        if let Some(caps) = regex.captures(line) {
            return build_event(*pattern, line, &caps);
        }
    }
    LineMatch::Unmatched
}

fn build_event(pattern: LinePattern, line: &str, caps: &regex::Captures<'_>) -> LineMatch {
    let text = |idx: usize| caps.get(idx).map(|m| m.as_str().trim().to_string());
    let step = || caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());

    let event = match pattern {
        LinePattern::Verifying => step().map(|step| LogEvent::Verification {
            step,
            expectation: text(2),
            status: VerificationStatus::Verifying,
            error: None,
        }),
        LinePattern::VerifyPassed => step().map(|step| LogEvent::Verification {
            step,
            expectation: None,
            status: VerificationStatus::VerifyPassed,
            error: None,
        }),
        LinePattern::VerifyFailed => step().map(|step| LogEvent::Verification {
            step,
            expectation: None,
            status: VerificationStatus::VerifyFailed,
            error: text(2),
        }),
        LinePattern::StepStarted => step().map(|step| LogEvent::Step {
            step,
            action: text(2),
            status: StepStatus::Started,
            error: None,
        }),
        LinePattern::StepPassed => step().map(|step| LogEvent::Step {
            step,
            action: None,
            status: StepStatus::Passed,
            error: None,
        }),
        LinePattern::StepFailed => step().map(|step| LogEvent::Step {
            step,
            action: None,
            status: StepStatus::Failed,
            error: text(2),
        }),
        LinePattern::Locating => Some(LogEvent::Locating {
            raw: line.to_string(),
        }),
        LinePattern::Bug => text(1).map(|message| LogEvent::Bug { message }),
        LinePattern::NewTab => text(1).map(|target_id| LogEvent::NewTab { target_id }),
    };

    event.map_or(LineMatch::Malformed, LineMatch::Event)
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn empty_chunk_yields_nothing() {
        assert!(parse_log_events("").is_empty());
        assert!(parse_log_events_basic("").is_empty());
    }

    #[test]
    fn step_started_captures_action() {
        let events = parse_log_events("STEP_3: click button");
        assert_eq!(
            events,
            vec![LogEvent::Step {
                step: 3,
                action: Some("click button".to_string()),
                status: StepStatus::Started,
                error: None,
            }]
        );
    }

    #[test]
    fn verification_failure_never_matches_step_pattern() {
        let events = parse_log_events("VERIFYING_STEP_3_FAILED: mismatch");
        assert_eq!(
            events,
            vec![LogEvent::Verification {
                step: 3,
                expectation: None,
                status: VerificationStatus::VerifyFailed,
                error: Some("mismatch".to_string()),
            }]
        );
    }

    #[test]
    fn verification_passed_is_not_a_step_pass() {
        let events = parse_log_events("VERIFYING_STEP_2_PASSED");
        assert!(matches!(
            events.as_slice(),
            [LogEvent::Verification {
                step: 2,
                status: VerificationStatus::VerifyPassed,
                ..
            }]
        ));
    }

    #[test]
    fn proposed_code_consumes_whole_chunk() {
        let chunk = "STEP_1: open page\nProposed code:\n  page.click('#go')\nSTEP_1_PASSED\n";
        let events = parse_log_events(chunk);
        assert_eq!(
            events,
            vec![LogEvent::Code {
                raw: "page.click('#go')\nSTEP_1_PASSED".to_string()
            }]
        );
    }

    #[test]
    fn sentinel_precedence_follows_fixed_order() {
        let events = parse_log_events("Reasoning next action...\nAbstracting page...");
        assert_eq!(
            events,
            vec![LogEvent::Abstracting {
                raw: "Abstracting page...".to_string()
            }]
        );
        let events = parse_log_events("INFO Checking page re-identification for tab");
        assert!(matches!(
            events.as_slice(),
            [LogEvent::ReIdentifying { .. }]
        ));
    }

    #[test]
    fn malformed_step_number_drops_only_that_line() {
        let chunk = "STEP_99999999999999: too big\nSTEP_2_PASSED";
        let events = parse_log_events(chunk);
        assert_eq!(
            events,
            vec![LogEvent::Step {
                step: 2,
                action: None,
                status: StepStatus::Passed,
                error: None,
            }]
        );
        // Basic mode drops it too rather than reporting it as Other.
        assert_eq!(parse_log_events_basic(chunk).len(), 1);
    }

    #[test]
    fn mixed_lines_keep_order_and_skip_noise() {
        let chunk = "2024-01-01 INFO STEP_1: type user\r\nnoise\n\nSTEP_1_FAILED: timeout\nBug reported:  login broken  \nNEW_TAB_OPENED: ABC123\nLocating element to click: \"Submit\"";
        let events = parse_log_events(chunk);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], LogEvent::Step { step: 1, status: StepStatus::Started, action: Some(a), .. } if a == "type user"));
        assert!(matches!(&events[1], LogEvent::Step { step: 1, status: StepStatus::Failed, error: Some(e), .. } if e == "timeout"));
        assert_eq!(
            events[2],
            LogEvent::Bug {
                message: "login broken".to_string()
            }
        );
        assert_eq!(
            events[3],
            LogEvent::NewTab {
                target_id: "ABC123".to_string()
            }
        );
        assert!(matches!(&events[4], LogEvent::Locating { raw } if raw.contains("Submit")));
    }

    #[test]
    fn basic_mode_keeps_unmatched_lines() {
        let events = parse_log_events_basic("hello\nSTEP_4_PASSED");
        assert_eq!(
            events[0],
            LogEvent::Other {
                raw: "hello".to_string()
            }
        );
        assert!(matches!(events[1], LogEvent::Step { step: 4, .. }));
        assert_eq!(ParseMode::Basic.parse("x").len(), 1);
        assert!(ParseMode::Rich.parse("x").is_empty());
    }

    #[test]
    fn parsing_is_idempotent() {
        let chunk = "VERIFYING_STEP_1: title shown\nVERIFYING_STEP_1_PASSED\nSTEP_2: go";
        assert_eq!(parse_log_events(chunk), parse_log_events(chunk));
    }

    #[test]
    fn bug_reports_collect_in_order() {
        let text = "start\nBug reported: first\nmiddle Bug reported:   second  \nBug reported:\n";
        assert_eq!(parse_bug_reports(text), vec!["first", "second"]);
        assert!(parse_bug_reports("nothing here").is_empty());
    }

    #[test]
    fn display_messages() {
        let started = LogEvent::Step {
            step: 2,
            action: Some("click login".to_string()),
            status: StepStatus::Started,
            error: None,
        };
        assert_eq!(started.display_message(), "Step 2: click login");
        let code = LogEvent::Code {
            raw: "x()".to_string(),
        };
        assert_eq!(code.display_message(), "Executing proposed code, x()");
        let verifying = LogEvent::Verification {
            step: 1,
            expectation: Some("logged in".to_string()),
            status: VerificationStatus::Verifying,
            error: None,
        };
        assert_eq!(verifying.display_message(), "Step 1: Verifying - logged in");
    }
}
