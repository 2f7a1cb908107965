//! Agent process capability.
//!
//! The coordinator only sees an [`AgentProcess`]: two async byte streams, a
//! one-shot exit notification and a signaller. [`TokioLauncher`] backs it with
//! a real child process placed in its own process group.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::model::{AgentExit, TargetId, TestDefinition, TestId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// Fully resolved agent invocation for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentCommand {
    pub test_id: TestId,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl AgentCommand {
    /// Build the agent invocation for a test bound to `target`.
    ///
    /// Argument order: configured args, test path, `--config`,
    /// `--cdp-endpoint`, `--fixture-file-path`, `--environment-file-path`,
    /// `--target-id`.
    pub fn for_run(
        agent: &AgentConfig,
        cdp_endpoint: &str,
        test: &TestDefinition,
        fixture_path: Option<&Path>,
        environment_path: Option<&Path>,
        target: &TargetId,
    ) -> Self {
        let mut args = agent.args.clone();
        args.push(test.full_path.display().to_string());
        if let Some(config_path) = &agent.config_path {
            args.push("--config".to_string());
            args.push(config_path.display().to_string());
        }
        args.push("--cdp-endpoint".to_string());
        args.push(cdp_endpoint.to_string());
        if let Some(path) = fixture_path {
            args.push("--fixture-file-path".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = environment_path {
            args.push("--environment-file-path".to_string());
            args.push(path.display().to_string());
        }
        args.push("--target-id".to_string());
        args.push(target.to_string());

        Self {
            test_id: test.id.clone(),
            program: agent.program.clone(),
            args,
            env: agent.env.clone(),
            cwd: agent.cwd.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    /// Polite request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL).
    Kill,
}

/// Delivers stop signals to a running agent. Signalling a process that has
/// already exited succeeds.
pub trait ProcessSignaller: Send + Sync {
    fn signal(&self, signal: StopSignal) -> Result<()>;
}

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// A spawned agent, as seen by the coordinator.
pub struct AgentProcess {
    pub pid: Option<u32>,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: oneshot::Receiver<AgentExit>,
    pub signaller: Arc<dyn ProcessSignaller>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, command: AgentCommand) -> Result<AgentProcess>;
}

/// Launches agents with `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, command: AgentCommand) -> Result<AgentProcess> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        // Own process group, so stop signals reach the agent's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| {
            Error::launch(format!("failed to spawn {}", command.program), err)
        })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::launch("agent stdout unavailable", "not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::launch("agent stderr unavailable", "not piped"))?;

        tracing::debug!(test_id = %command.test_id, pid = ?pid, program = %command.program, "agent spawned");

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => AgentExit::from(status),
                Err(err) => AgentExit::Lost {
                    message: format!("failed to wait for agent: {err}"),
                },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(AgentProcess {
            pid,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit_rx,
            signaller: Arc::new(GroupSignaller { pid }),
        })
    }
}

/// Signals the process group led by the agent.
struct GroupSignaller {
    pid: Option<u32>,
}

impl ProcessSignaller for GroupSignaller {
    #[cfg(unix)]
    fn signal(&self, signal: StopSignal) -> Result<()> {
        use nix::sys::signal::Signal;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return Ok(());
        };
        let signal = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        signal_process_group(Pid::from_raw(pid), signal)
    }

    #[cfg(not(unix))]
    fn signal(&self, signal: StopSignal) -> Result<()> {
        tracing::warn!(pid = ?self.pid, ?signal, "process group signals are unsupported on this platform");
        Ok(())
    }
}

#[cfg(unix)]
fn signal_process_group(pgid: nix::unistd::Pid, signal: nix::sys::signal::Signal) -> Result<()> {
    match nix::sys::signal::killpg(pgid, signal) {
        // ESRCH: the group is already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(Error::signal("failed to signal process group", err)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TestAction;

    fn test_definition() -> TestDefinition {
        TestDefinition {
            id: TestId::from("login"),
            name: "Login".to_string(),
            url: None,
            fixture_id: Some("fx".to_string()),
            actions: vec![TestAction::default()],
            full_path: PathBuf::from("/ws/.webtestpilot/.test/login.json"),
        }
    }

    #[test]
    fn command_argument_order() {
        let agent = AgentConfig {
            program: "python".to_string(),
            args: vec!["cli.py".to_string()],
            config_path: Some(PathBuf::from("/cfg.yaml")),
            cwd: None,
            env: BTreeMap::new(),
        };
        let command = AgentCommand::for_run(
            &agent,
            "http://localhost:9222",
            &test_definition(),
            Some(Path::new("/fx.json")),
            Some(Path::new("/env.json")),
            &TargetId::new("T1"),
        );
        assert_eq!(
            command.args,
            vec![
                "cli.py",
                "/ws/.webtestpilot/.test/login.json",
                "--config",
                "/cfg.yaml",
                "--cdp-endpoint",
                "http://localhost:9222",
                "--fixture-file-path",
                "/fx.json",
                "--environment-file-path",
                "/env.json",
                "--target-id",
                "T1",
            ]
        );
    }

    #[test]
    fn optional_arguments_are_omitted() {
        let mut agent = AgentConfig::default();
        agent.args.clear();
        let command = AgentCommand::for_run(
            &agent,
            "ws://browser",
            &test_definition(),
            None,
            None,
            &TargetId::new("T2"),
        );
        assert!(!command.args.iter().any(|arg| arg == "--config"));
        assert!(!command.args.iter().any(|arg| arg == "--fixture-file-path"));
        assert!(!command.args.iter().any(|arg| arg == "--environment-file-path"));
        assert_eq!(command.env.get("BAML_LOG").map(String::as_str), Some("info"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_launcher_reports_exit_and_output() {
        use tokio::io::AsyncReadExt;

        let command = AgentCommand {
            test_id: TestId::from("sh"),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo STEP_1: go; exit 3".to_string()],
            env: BTreeMap::new(),
            cwd: None,
        };
        let mut process = TokioLauncher.spawn(command).await.unwrap();
        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "STEP_1: go");
        assert_eq!(process.exit.await.unwrap(), AgentExit::code(3));
        process.signaller.signal(StopSignal::Kill).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_sleeping_agent() {
        let command = AgentCommand {
            test_id: TestId::from("sleep"),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            env: BTreeMap::new(),
            cwd: None,
        };
        let process = TokioLauncher.spawn(command).await.unwrap();
        process.signaller.signal(StopSignal::Terminate).unwrap();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), process.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(exit.terminated_by_stop_signal());
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let command = AgentCommand {
            test_id: TestId::from("x"),
            program: "/definitely/not/a/program".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        };
        let err = TokioLauncher.spawn(command).await.err().unwrap();
        assert_eq!(err.code, crate::ErrorCode::Launch);
    }
}
