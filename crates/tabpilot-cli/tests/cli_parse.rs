//! Tests for the `parse`, `list` and `completions` commands.
// Test module - relaxed lint rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]
#![allow(missing_docs)]

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

const AGENT_LOG: &str = "\
STEP_1: click login
Locating element to click: \"Login button\"
STEP_1_PASSED
VERIFYING_STEP_1: form is visible
VERIFYING_STEP_1_FAILED: form missing
Bug reported: login form never rendered
some unrelated chatter
";

fn tabpilot_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tabpilot"))
}

fn json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line is json"))
        .collect()
}

#[test]
fn parse_file_prints_display_messages() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("agent.log");
    fs::write(&log, AGENT_LOG).unwrap();

    let output = tabpilot_bin().arg("parse").arg(&log).output().unwrap();
    assert!(
        output.status.success(),
        "parse failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Step 1: click login",
            "Locating element to click: \"Login button\"",
            "Step 1 passed",
            "Step 1: Verifying - form is visible",
            "Step 1 verification failed: form missing",
            "Bug reported: login form never rendered",
        ]
    );
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 bug report(s)"));
}

#[test]
fn parse_json_emits_tagged_events() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("agent.log");
    fs::write(&log, AGENT_LOG).unwrap();

    let output = tabpilot_bin()
        .args(["parse", "--json"])
        .arg(&log)
        .output()
        .unwrap();
    assert!(output.status.success());
    let events = json_lines(&output.stdout);
    assert_eq!(events.len(), 6);
    assert_eq!(events[0]["type"], "step");
    assert_eq!(events[0]["step"], 1);
    assert_eq!(events[0]["status"], "started");
    assert_eq!(events[4]["type"], "verification");
    assert_eq!(events[4]["status"], "verifyFailed");
    assert_eq!(events[4]["error"], "form missing");
    assert_eq!(events[5]["type"], "bug");
}

#[test]
fn parse_basic_keeps_unmatched_lines() {
    let mut child = tabpilot_bin()
        .args(["parse", "--basic", "--json"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(AGENT_LOG.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let events = json_lines(&output.stdout);
    assert_eq!(events.len(), 7);
    assert_eq!(events[6]["type"], "other");
    assert_eq!(events[6]["raw"], "some unrelated chatter");
}

#[test]
fn parse_sentinel_chunk_is_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("code.log");
    fs::write(&log, "STEP_2: type name\nProposed code:\npage.fill('#name', 'x')\n").unwrap();

    let output = tabpilot_bin()
        .args(["parse", "--json"])
        .arg(&log)
        .output()
        .unwrap();
    let events = json_lines(&output.stdout);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "code");
    assert_eq!(events[0]["raw"], "page.fill('#name', 'x')");
}

#[test]
fn parse_missing_file_fails() {
    let output = tabpilot_bin()
        .args(["--color=never", "parse", "/nonexistent/agent.log"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read"));
}

#[test]
fn list_shows_tests_with_relative_paths() {
    let dir = tempfile::tempdir().unwrap();
    let tests = dir.path().join(".webtestpilot").join(".test");
    fs::create_dir_all(tests.join("auth")).unwrap();
    fs::write(
        tests.join("home.json"),
        r#"{"id": "home", "name": "Home page", "actions": [{"action": "open"}]}"#,
    )
    .unwrap();
    fs::write(
        tests.join("auth").join("login.json"),
        r#"{"id": "login", "actions": [{"action": "a"}, {"action": "b"}]}"#,
    )
    .unwrap();

    let output = tabpilot_bin()
        .args(["list", "--json", "--workspace"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "list failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let listed = json_lines(&output.stdout);
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], "home");
    assert_eq!(listed[0]["path"], "home.json");
    assert_eq!(listed[1]["id"], "login");
    assert_eq!(listed[1]["name"], "login");
    assert_eq!(listed[1]["steps"], 2);

    let output = tabpilot_bin()
        .args(["list", "--folder", "auth", "--workspace"])
        .arg(dir.path())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.starts_with("login\tlogin\t2 steps"));
}

#[test]
fn list_without_workspace_layout_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = tabpilot_bin()
        .args(["--color=never", "list", "--workspace"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains(".webtestpilot"));
}

#[test]
fn completions_generate_for_bash() {
    let output = tabpilot_bin().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("tabpilot"));
}
