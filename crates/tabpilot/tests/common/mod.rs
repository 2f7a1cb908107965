// Test module - relaxed lint rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(missing_docs)]
#![allow(dead_code)]

//! Fake collaborators for coordinator tests.
//!
//! - [`FakeLauncher`]: replays scripted agent output over in-memory pipes
//! - [`FlakySession`]: detached browser session that fails chosen tab opens
//! - [`FrameSource`]: capture provider that yields a fixed number of frames

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabpilot::browser::{
    BrowserProvider, BrowserSession, BrowserTab, CaptureStream, DetachedSession, Frame,
    FrameCapture, NoCapture,
};
use tabpilot::config::CoordinatorConfig;
use tabpilot::coordinator::{Collaborators, ExecutionCoordinator};
use tabpilot::process::{AgentCommand, AgentProcess, ProcessLauncher, ProcessSignaller, StopSignal};
use tabpilot::sink::CollectingSink;
use tabpilot::store::{EnvironmentSelection, FixedEnvironment, MemoryStore, TestStore};
use tabpilot::{
    AgentExit, Error, Result, SinkEvent, TestAction, TestDefinition, TestId, TestOutcome, SIGKILL,
    SIGTERM,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug)]
pub enum Step {
    Stdout(String),
    Stderr(String),
    Sleep(u64),
    Exit(i32),
}

/// Scripted agent behaviour. Without an `Exit` step the agent runs until
/// signalled.
#[derive(Clone, Debug, Default)]
pub struct Script {
    steps: Vec<Step>,
    ignores_term: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.steps.push(Step::Stdout(text.to_string()));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.steps.push(Step::Stderr(text.to_string()));
        self
    }

    pub fn sleep_ms(mut self, ms: u64) -> Self {
        self.steps.push(Step::Sleep(ms));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.steps.push(Step::Exit(code));
        self
    }

    pub fn ignore_term(mut self) -> Self {
        self.ignores_term = true;
        self
    }

    pub fn passing() -> Self {
        Self::new().exit(0)
    }
}

/// Signals received by fake agents, in order.
pub type SignalLog = Arc<Mutex<Vec<(TestId, StopSignal)>>>;

#[derive(Default)]
pub struct FakeLauncher {
    scripts: Mutex<HashMap<TestId, Vec<Script>>>,
    commands: Mutex<Vec<AgentCommand>>,
    pub signals: SignalLog,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next launch of `test_id`. Unscripted launches
    /// exit 0 immediately.
    pub fn script(self, test_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(TestId::from(test_id))
            .or_default()
            .push(script);
        self
    }

    pub fn commands(&self) -> Vec<AgentCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn signals_for(&self, test_id: &str) -> Vec<StopSignal> {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == test_id)
            .map(|(_, signal)| *signal)
            .collect()
    }

    fn next_script(&self, test_id: &TestId) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(test_id) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Script::passing(),
        }
    }
}

struct FakeSignaller {
    test_id: TestId,
    tx: mpsc::UnboundedSender<StopSignal>,
    log: SignalLog,
}

impl ProcessSignaller for FakeSignaller {
    fn signal(&self, signal: StopSignal) -> Result<()> {
        self.log.lock().unwrap().push((self.test_id.clone(), signal));
        let _ = self.tx.send(signal);
        Ok(())
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, command: AgentCommand) -> Result<AgentProcess> {
        let script = self.next_script(&command.test_id);
        let test_id = command.test_id.clone();
        self.commands.lock().unwrap().push(command);

        let (stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_script(
            script,
            stdout_writer,
            stderr_writer,
            signal_tx.clone(),
            signal_rx,
            exit_tx,
        ));

        Ok(AgentProcess {
            pid: None,
            stdout: Box::pin(stdout_reader),
            stderr: Box::pin(stderr_reader),
            exit: exit_rx,
            signaller: Arc::new(FakeSignaller {
                test_id,
                tx: signal_tx,
                log: Arc::clone(&self.signals),
            }),
        })
    }
}

/// Launcher whose spawns always fail.
pub struct BrokenLauncher;

#[async_trait]
impl ProcessLauncher for BrokenLauncher {
    async fn spawn(&self, command: AgentCommand) -> Result<AgentProcess> {
        Err(Error::launch(
            format!("failed to spawn {}", command.program),
            "No such file or directory",
        ))
    }
}

fn stop_exit(signal: StopSignal, ignores_term: bool) -> Option<AgentExit> {
    match signal {
        StopSignal::Kill => Some(AgentExit::signaled(SIGKILL)),
        StopSignal::Terminate if ignores_term => None,
        StopSignal::Terminate => Some(AgentExit::signaled(SIGTERM)),
    }
}

async fn sleep_or_stop(
    ms: u64,
    signals: &mut mpsc::UnboundedReceiver<StopSignal>,
    ignores_term: bool,
) -> Option<AgentExit> {
    let sleep = tokio::time::sleep(Duration::from_millis(ms));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return None,
            Some(signal) = signals.recv() => {
                if let Some(exit) = stop_exit(signal, ignores_term) {
                    return Some(exit);
                }
            }
        }
    }
}

async fn run_script(
    script: Script,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    // Held so the signal channel never closes while the agent runs.
    _keepalive: mpsc::UnboundedSender<StopSignal>,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: oneshot::Sender<AgentExit>,
) {
    let mut exit = None;
    for step in script.steps {
        match step {
            Step::Stdout(text) => {
                let _ = stdout.write_all(text.as_bytes()).await;
            }
            Step::Stderr(text) => {
                let _ = stderr.write_all(text.as_bytes()).await;
            }
            Step::Sleep(ms) => {
                exit = sleep_or_stop(ms, &mut signals, script.ignores_term).await;
                if exit.is_some() {
                    break;
                }
            }
            Step::Exit(code) => {
                exit = Some(AgentExit::code(code));
                break;
            }
        }
    }
    let exit = match exit {
        Some(exit) => exit,
        None => loop {
            if let Some(signal) = signals.recv().await {
                if let Some(exit) = stop_exit(signal, script.ignores_term) {
                    break exit;
                }
            }
        },
    };
    drop(stdout);
    drop(stderr);
    let _ = exit_tx.send(exit);
}

/// Detached session that fails the n-th tab opens (1-based).
pub struct FlakySession {
    tabs: DetachedSession,
    opened: AtomicUsize,
    fail_on: Vec<usize>,
    pub clears: AtomicUsize,
}

impl FlakySession {
    pub fn new(fail_on: Vec<usize>) -> Self {
        Self {
            tabs: DetachedSession::new("fake://browser"),
            opened: AtomicUsize::new(0),
            fail_on,
            clears: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrowserSession for FlakySession {
    async fn new_tab(&self) -> Result<Arc<dyn BrowserTab>> {
        let ordinal = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&ordinal) {
            return Err(Error::browser(format!("tab {ordinal} could not be created")));
        }
        self.tabs.new_tab().await
    }

    fn tabs(&self) -> Vec<Arc<dyn BrowserTab>> {
        self.tabs.tabs()
    }

    async fn close_all_tabs(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.tabs.close_all_tabs().await
    }
}

pub struct FakeBrowser {
    pub session: Arc<FlakySession>,
}

#[async_trait]
impl BrowserProvider for FakeBrowser {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn BrowserSession>> {
        let session: Arc<dyn BrowserSession> = self.session.clone();
        Ok(session)
    }
}

pub struct UnreachableBrowser;

#[async_trait]
impl BrowserProvider for UnreachableBrowser {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>> {
        Err(Error::browser(format!("connection refused: {endpoint}")))
    }
}

/// Yields `frames` frames per tab, then ends.
#[derive(Default)]
pub struct FrameSource {
    pub frames: usize,
    pub acks: Arc<AtomicUsize>,
}

struct FrameStream {
    remaining: usize,
    next_id: u64,
    acks: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureStream for FrameStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.next_id += 1;
        Some(Frame {
            data: format!("frame-{}", self.next_id),
            session_id: self.next_id,
        })
    }

    async fn ack(&mut self, _frame: &Frame) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FrameCapture for FrameSource {
    async fn start(&self, _tab: Arc<dyn BrowserTab>) -> Result<Box<dyn CaptureStream>> {
        Ok(Box::new(FrameStream {
            remaining: self.frames,
            next_id: 0,
            acks: Arc::clone(&self.acks),
        }))
    }
}

pub fn definition(id: &str) -> TestDefinition {
    TestDefinition {
        id: TestId::from(id),
        name: format!("Test {id}"),
        url: Some(format!("https://example.test/{id}")),
        fixture_id: None,
        actions: vec![
            TestAction {
                action: "open page".to_string(),
                expected_result: "page loads".to_string(),
            },
            TestAction {
                action: "click login".to_string(),
                expected_result: "form shown".to_string(),
            },
        ],
        full_path: PathBuf::from(format!("/ws/.webtestpilot/.test/{id}.json")),
    }
}

pub fn definitions(ids: &[&str]) -> Vec<TestDefinition> {
    ids.iter().map(|id| definition(id)).collect()
}

pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig {
        launch_delay_ms: 5,
        stop_grace_ms: 200,
        drain_timeout_ms: 1000,
        ..CoordinatorConfig::default()
    };
    config.agent.program = "fake-agent".to_string();
    config.agent.args.clear();
    config
}

pub struct Harness {
    pub coordinator: ExecutionCoordinator,
    pub sink: Arc<CollectingSink>,
    pub launcher: Arc<FakeLauncher>,
    pub session: Arc<FlakySession>,
}

pub struct HarnessBuilder {
    launcher: FakeLauncher,
    config: CoordinatorConfig,
    fail_tabs: Vec<usize>,
    capture: Arc<dyn FrameCapture>,
    store: Arc<dyn TestStore>,
    environments: Arc<dyn EnvironmentSelection>,
}

impl HarnessBuilder {
    pub fn new(launcher: FakeLauncher) -> Self {
        Self {
            launcher,
            config: fast_config(),
            fail_tabs: Vec::new(),
            capture: Arc::new(NoCapture),
            store: Arc::new(MemoryStore::new()),
            environments: Arc::new(FixedEnvironment::none()),
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fail_tabs(mut self, ordinals: &[usize]) -> Self {
        self.fail_tabs = ordinals.to_vec();
        self
    }

    pub fn capture(mut self, capture: Arc<dyn FrameCapture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn store(mut self, store: Arc<dyn TestStore>) -> Self {
        self.store = store;
        self
    }

    pub fn environments(mut self, environments: Arc<dyn EnvironmentSelection>) -> Self {
        self.environments = environments;
        self
    }

    /// Build and connect.
    pub async fn connect(self) -> Harness {
        let launcher = Arc::new(self.launcher);
        let session = Arc::new(FlakySession::new(self.fail_tabs));
        let sink = Arc::new(CollectingSink::new());
        let coordinator = ExecutionCoordinator::new(
            self.config,
            Collaborators {
                launcher: launcher.clone(),
                browser: Arc::new(FakeBrowser {
                    session: session.clone(),
                }),
                capture: self.capture,
                store: self.store,
                environments: self.environments,
            },
            sink.clone(),
        );
        coordinator
            .connect("fake://browser", Some("suite".to_string()))
            .await
            .unwrap();
        Harness {
            coordinator,
            sink,
            launcher,
            session,
        }
    }
}

impl Harness {
    pub async fn run_batch(&self, ids: &[&str]) {
        self.coordinator.start_batch(definitions(ids)).await;
        self.wait_idle().await;
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.coordinator.wait_idle())
            .await
            .expect("agents did not finish");
    }

    /// Every `testFinished` outcome for a test.
    pub fn outcomes(&self, test_id: &str) -> Vec<TestOutcome> {
        self.sink
            .events_for(&TestId::from(test_id))
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::TestFinished { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn outcome(&self, test_id: &str) -> TestOutcome {
        let outcomes = self.outcomes(test_id);
        assert_eq!(outcomes.len(), 1, "expected one outcome for {test_id}: {outcomes:?}");
        outcomes.into_iter().next().unwrap()
    }

    pub fn started(&self) -> Vec<TestId> {
        self.sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::TestStarted { test_id, .. } => Some(test_id),
                _ => None,
            })
            .collect()
    }
}
