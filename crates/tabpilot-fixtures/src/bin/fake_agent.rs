//! Agent fixture: replays a scripted log instead of driving a browser.
//! Used for testing the coordinator and CLI end to end.
//!
//! Usage: `tabpilot-fake-agent --script <file-or-dir> <test-path> [agent flags...]`
//!
//! When `--script` names a directory, the script is `<dir>/<test stem>.json`.
//! A missing script behaves like an empty one (exit 0, no output).

// Test fixtures require special allowances - they are not production code
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]
#![allow(clippy::exit)]

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use tabpilot_fixtures::{AgentScript, ScriptStep};

fn script_path(args: &[String]) -> Option<PathBuf> {
    let position = args.iter().position(|arg| arg == "--script")?;
    let script = PathBuf::from(args.get(position + 1)?);
    if !script.is_dir() {
        return Some(script);
    }
    let test_path = args.get(position + 2)?;
    let stem = Path::new(test_path).file_stem()?;
    Some(script.join(stem).with_extension("json"))
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let script = match script_path(&args) {
        Some(path) if path.exists() => match AgentScript::load(&path) {
            Ok(script) => script,
            Err(err) => {
                eprintln!("invalid agent script: {err}");
                process::exit(64);
            }
        },
        _ => AgentScript::new(),
    };

    if script.ignore_term {
        // The handler swallows SIGINT/SIGTERM; only SIGKILL stops us.
        if let Err(err) = ctrlc::set_handler(|| {}) {
            eprintln!("failed to install signal handler: {err}");
        }
    }

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    for step in &script.steps {
        match step {
            ScriptStep::Stdout { text } => {
                writeln!(stdout, "{text}").ok();
                stdout.flush().ok();
            }
            ScriptStep::Stderr { text } => {
                writeln!(stderr, "{text}").ok();
                stderr.flush().ok();
            }
            ScriptStep::Sleep { ms } => thread::sleep(Duration::from_millis(*ms)),
            ScriptStep::EchoArgs => {
                writeln!(stdout, "ARGS: {}", args.join(" ")).ok();
                stdout.flush().ok();
            }
            ScriptStep::Hang => loop {
                thread::sleep(Duration::from_secs(60));
            },
        }
    }

    process::exit(script.exit_code);
}
