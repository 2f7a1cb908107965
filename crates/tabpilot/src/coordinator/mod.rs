//! Parallel run coordination.
//!
//! [`ExecutionCoordinator`] owns every [`RunExecution`] of the current batch.
//! It staggers launches, multiplexes each agent's output through the parser,
//! and routes derived events to the [`EventSink`].
//!
//! Every message from a run's tasks carries `(test_id, run_id)`. Handlers
//! re-fetch the entry under the run table lock and drop anything addressed to
//! an unknown test or a superseded run. The lock is never held across an
//! `.await`; events are emitted before it is released so a run's events reach
//! the sink in the order its state changed.

mod io;

use crate::browser::{BrowserProvider, BrowserSession, BrowserTab, DetachedBrowser, FrameCapture, NoCapture};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::execution::RunExecution;
use crate::model::{AgentExit, Command, LogChannel, RunId, SinkEvent, TestDefinition, TestId};
use crate::process::{AgentCommand, AgentProcess, ProcessLauncher, ProcessSignaller, StopSignal, TokioLauncher};
use crate::sink::EventSink;
use crate::store::{EnvironmentSelection, TestStore};
use self::io::Decoded;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Injected capabilities.
pub struct Collaborators {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub browser: Arc<dyn BrowserProvider>,
    pub capture: Arc<dyn FrameCapture>,
    pub store: Arc<dyn TestStore>,
    pub environments: Arc<dyn EnvironmentSelection>,
}

impl Collaborators {
    /// Real agent processes, a detached browser session and no capture.
    pub fn local(store: Arc<dyn TestStore>, environments: Arc<dyn EnvironmentSelection>) -> Self {
        Self {
            launcher: Arc::new(TokioLauncher),
            browser: Arc::new(DetachedBrowser),
            capture: Arc::new(NoCapture),
            store,
            environments,
        }
    }
}

/// Handle to the coordinator. Clones share the same state.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    browser: Arc<dyn BrowserProvider>,
    capture: Arc<dyn FrameCapture>,
    store: Arc<dyn TestStore>,
    environments: Arc<dyn EnvironmentSelection>,
    sink: Arc<dyn EventSink>,
    session: Mutex<Option<ConnectedSession>>,
    runs: Mutex<Vec<RunEntry>>,
    epoch: AtomicU64,
    live: watch::Sender<usize>,
    disposed: AtomicBool,
}

#[derive(Clone)]
struct ConnectedSession {
    endpoint: String,
    session: Arc<dyn BrowserSession>,
}

struct RunEntry {
    execution: RunExecution,
    /// Present once the tab is attached and the process spawned.
    resources: Option<RunResources>,
}

enum Insert {
    Added,
    Replaced(Box<RunEntry>),
    Superseded,
}

struct RunResources {
    signaller: Arc<dyn ProcessSignaller>,
    exited: CancellationToken,
    capture: CancellationToken,
    tab: Arc<dyn BrowserTab>,
}

impl ExecutionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        collaborators: Collaborators,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                launcher: collaborators.launcher,
                browser: collaborators.browser,
                capture: collaborators.capture,
                store: collaborators.store,
                environments: collaborators.environments,
                sink,
                session: Mutex::new(None),
                runs: Mutex::new(Vec::new()),
                epoch: AtomicU64::new(0),
                live,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Attach the shared browser session.
    pub async fn connect(&self, endpoint: &str, folder_name: Option<String>) -> Result<()> {
        match self.inner.browser.connect(endpoint).await {
            Ok(session) => {
                info!(%endpoint, "browser session connected");
                *self.inner.session_slot() = Some(ConnectedSession {
                    endpoint: endpoint.to_string(),
                    session,
                });
                self.inner.sink.emit(SinkEvent::Connected { folder_name });
                Ok(())
            }
            Err(err) => {
                warn!(%endpoint, error = %err, "browser connection failed");
                self.inner.sink.emit(SinkEvent::Error {
                    message: format!(
                        "Failed to connect to browser at {endpoint}: {}",
                        err.detail()
                    ),
                });
                Err(err)
            }
        }
    }

    /// Clear the previous batch, then launch `tests` in order with
    /// `launch_delay` between launches. Returns once every test has been
    /// launched or the batch was superseded.
    pub async fn start_batch(&self, tests: Vec<TestDefinition>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.clear(false).await;
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(tests = tests.len(), epoch, "starting batch");

        for (index, test) in tests.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.config.launch_delay()).await;
            }
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!(epoch, "batch superseded");
                break;
            }
            self.inner.launch(test, epoch).await;
        }
    }

    /// Load a folder's tests from the store and run them as a batch.
    pub async fn start_folder(&self, folder_id: &str) -> Result<usize> {
        let tests = match self.inner.store.tests_in_folder(folder_id) {
            Ok(tests) => tests,
            Err(err) => {
                self.inner.sink.emit(SinkEvent::Error {
                    message: err.detail(),
                });
                return Err(err);
            }
        };
        let count = tests.len();
        self.start_batch(tests).await;
        Ok(count)
    }

    /// Look up one test by id and run it as a batch of one. An unknown id is
    /// reported to the sink and returned as an error.
    pub async fn start_test(&self, test_id: &TestId) -> Result<()> {
        let test = match self.inner.store.test(test_id) {
            Ok(Some(test)) => test,
            Ok(None) => {
                let err = Error::store(format!("unknown test: {test_id}"));
                self.inner.sink.emit(SinkEvent::Error {
                    message: err.detail(),
                });
                return Err(err);
            }
            Err(err) => {
                self.inner.sink.emit(SinkEvent::Error {
                    message: err.detail(),
                });
                return Err(err);
            }
        };
        self.start_batch(vec![test]).await;
        Ok(())
    }

    /// Request a stop. Returns false when the test has no live process.
    pub fn stop_run(&self, test_id: &TestId) -> bool {
        self.inner.with_runs(|runs| {
            runs.iter_mut()
                .find(|entry| entry.execution.test_id() == test_id)
                .is_some_and(|entry| self.inner.begin_stop(entry))
        })
    }

    /// Stop every live run. Returns how many stops were issued.
    pub fn stop_all_runs(&self) -> usize {
        self.inner.with_runs(|runs| {
            runs.iter_mut()
                .map(|entry| self.inner.begin_stop(entry))
                .filter(|stopped| *stopped)
                .count()
        })
    }

    /// Stop launching the current batch and stop every live run. Unlike
    /// [`Self::clear_all_tabs`], runs keep their entries so their outcomes
    /// are still reported.
    pub fn interrupt(&self) -> usize {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_all_runs()
    }

    /// Stop live runs, close every tab and forget all runs.
    pub async fn clear_all_tabs(&self) {
        self.inner.clear(true).await;
    }

    pub async fn dispatch(&self, command: Command) {
        match command {
            Command::Ready => debug!("client ready"),
            Command::StopTest { test_id } => {
                if !self.stop_run(&test_id) {
                    debug!(test_id = %test_id, "stop requested for idle test");
                }
            }
            Command::StopAll => {
                let stopped = self.stop_all_runs();
                debug!(stopped, "stop all");
            }
            Command::ViewLogs { test_id } => {
                let logs = self.inner.with_runs(|runs| {
                    runs.iter()
                        .find(|entry| entry.execution.test_id() == &test_id)
                        .map(|entry| entry.execution.logs())
                });
                self.inner.sink.emit(logs.unwrap_or_else(|| SinkEvent::Error {
                    message: format!("No logs available for test: {test_id}"),
                }));
            }
            Command::ClearTabs => self.clear_all_tabs().await,
        }
    }

    /// Resolves once no agent process is alive.
    pub async fn wait_idle(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|count| *count == 0).await;
    }

    /// Number of agent processes still alive.
    pub fn live_processes(&self) -> usize {
        *self.inner.live.borrow()
    }

    /// Copies of all runs, in launch order.
    pub fn snapshot(&self) -> Vec<RunExecution> {
        self.inner.with_runs(|runs| {
            runs.iter()
                .map(|entry| entry.execution.clone())
                .collect()
        })
    }

    pub fn run(&self, test_id: &TestId) -> Option<RunExecution> {
        self.inner.with_runs(|runs| {
            runs.iter()
                .find(|entry| entry.execution.test_id() == test_id)
                .map(|entry| entry.execution.clone())
        })
    }

    /// Stop everything and release the browser session. Safe to call more
    /// than once.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing coordinator");
        self.inner.clear(false).await;
        let connected = self.inner.session_slot().take();
        if let Some(connected) = connected {
            if let Err(err) = connected.session.close().await {
                warn!(error = %err, "failed to close browser session");
            }
        }
    }
}

impl Inner {
    fn with_runs<R>(&self, f: impl FnOnce(&mut Vec<RunEntry>) -> R) -> R {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut runs)
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<ConnectedSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Option<ConnectedSession> {
        self.session_slot().clone()
    }

    fn emit_all(&self, events: impl IntoIterator<Item = SinkEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    async fn launch(self: &Arc<Self>, test: TestDefinition, epoch: u64) {
        let run_id = RunId::new();
        let test_id = test.id.clone();
        if !self.insert_pending(&test, run_id, epoch).await {
            debug!(test_id = %test_id, epoch, "batch superseded before launch");
            return;
        }
        debug!(test_id = %test_id, run_id = %run_id, "launching");

        if let Err(err) = self.spawn_run(&test, run_id).await {
            warn!(test_id = %test_id, run_id = %run_id, error = %err, "launch failed");
            self.with_runs(|runs| {
                if let Some(entry) = find_run(runs, &test_id, run_id) {
                    self.emit_all(entry.execution.mark_errored(err.detail()));
                }
            });
        }
    }

    /// Add a pending entry, replacing any earlier run of the same test.
    /// Returns false, inserting nothing, once `epoch` is no longer current.
    async fn insert_pending(&self, test: &TestDefinition, run_id: RunId, epoch: u64) -> bool {
        let entry = RunEntry {
            execution: RunExecution::new(test, run_id),
            resources: None,
        };
        let insert = self.with_runs(|runs| {
            // Checked under the run lock: `clear` bumps the epoch before taking it.
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Insert::Superseded;
            }
            match runs
                .iter_mut()
                .find(|existing| existing.execution.test_id() == &test.id)
            {
                Some(existing) => Insert::Replaced(Box::new(std::mem::replace(existing, entry))),
                None => {
                    runs.push(entry);
                    Insert::Added
                }
            }
        });
        match insert {
            Insert::Superseded => false,
            Insert::Added => true,
            Insert::Replaced(mut previous) => {
                self.begin_stop(&mut previous);
                if let Some(resources) = previous.resources {
                    resources.capture.cancel();
                    close_tab(resources.tab.as_ref()).await;
                }
                true
            }
        }
    }

    async fn spawn_run(self: &Arc<Self>, test: &TestDefinition, run_id: RunId) -> Result<()> {
        let connected = self
            .session()
            .ok_or_else(|| Error::browser("browser session is not connected"))?;
        let tab = connected.session.new_tab().await?;

        let fixture_path = self.fixture_path(test);
        let environment_path = self
            .environments
            .selected_environment()
            .map(|environment| environment.full_path);
        let command = AgentCommand::for_run(
            &self.config.agent,
            &connected.endpoint,
            test,
            fixture_path.as_deref(),
            environment_path.as_deref(),
            tab.target_id(),
        );

        let process = match self.launcher.spawn(command).await {
            Ok(process) => process,
            Err(err) => {
                close_tab(tab.as_ref()).await;
                return Err(err);
            }
        };

        if let Err((tab, process)) = self.attach(&test.id, run_id, tab, process) {
            debug!(test_id = %test.id, run_id = %run_id, "run superseded during launch");
            if let Err(err) = process.signaller.signal(StopSignal::Kill) {
                warn!(test_id = %test.id, error = %err, "failed to kill superseded agent");
            }
            close_tab(tab.as_ref()).await;
        }
        Ok(())
    }

    /// Bind a spawned process to its pending entry and start its tasks.
    /// Hands the resources back when the entry is gone.
    #[allow(clippy::result_large_err)]
    fn attach(
        self: &Arc<Self>,
        test_id: &TestId,
        run_id: RunId,
        tab: Arc<dyn BrowserTab>,
        process: AgentProcess,
    ) -> std::result::Result<(), (Arc<dyn BrowserTab>, AgentProcess)> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = find_run(&mut runs, test_id, run_id) else {
            return Err((tab, process));
        };

        let AgentProcess {
            pid,
            stdout,
            stderr,
            exit,
            signaller,
        } = process;
        let exited = CancellationToken::new();
        let capture = CancellationToken::new();

        let started = entry.execution.mark_running(tab.target_id().clone());
        info!(test_id = %test_id, run_id = %run_id, pid = ?pid, target_id = %tab.target_id(), "test started");
        self.sink.emit(started);
        self.live.send_modify(|count| *count += 1);

        let readers = vec![
            tokio::spawn(io::pump_output(
                Arc::clone(self),
                test_id.clone(),
                run_id,
                LogChannel::Stdout,
                stdout,
            )),
            tokio::spawn(io::pump_output(
                Arc::clone(self),
                test_id.clone(),
                run_id,
                LogChannel::Stderr,
                stderr,
            )),
        ];
        tokio::spawn(io::await_exit(
            Arc::clone(self),
            test_id.clone(),
            run_id,
            exit,
            exited.clone(),
            readers,
        ));
        tokio::spawn(io::capture_frames(
            Arc::clone(self),
            test_id.clone(),
            run_id,
            Arc::clone(&tab),
            capture.clone(),
        ));

        entry.resources = Some(RunResources {
            signaller,
            exited,
            capture,
            tab,
        });
        Ok(())
    }

    fn fixture_path(&self, test: &TestDefinition) -> Option<PathBuf> {
        let fixture_id = test.fixture_id.as_deref()?;
        match self.store.fixture(fixture_id) {
            Ok(Some(fixture)) => Some(fixture.full_path),
            Ok(None) => {
                warn!(test_id = %test.id, fixture_id, "fixture not found");
                None
            }
            Err(err) => {
                warn!(test_id = %test.id, fixture_id, error = %err, "fixture lookup failed");
                None
            }
        }
    }

    /// SIGTERM now, SIGKILL after the grace period unless the process exits.
    fn begin_stop(&self, entry: &mut RunEntry) -> bool {
        if !entry.execution.request_stop() {
            return false;
        }
        let test_id = entry.execution.test_id().clone();
        if let Some(resources) = &entry.resources {
            info!(test_id = %test_id, run_id = %entry.execution.run_id(), "stopping run");
            if let Err(err) = resources.signaller.signal(StopSignal::Terminate) {
                warn!(test_id = %test_id, error = %err, "failed to terminate agent");
            }
            resources.capture.cancel();
            let escalation = io::escalate_stop(
                test_id.clone(),
                Arc::clone(&resources.signaller),
                resources.exited.clone(),
                self.config.stop_grace(),
            );
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(escalation);
                }
                Err(_) => warn!(test_id = %test_id, "no runtime to escalate stop"),
            }
        }
        true
    }

    async fn clear(&self, announce: bool) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let entries = self.with_runs(std::mem::take);
        let mut tabs = Vec::new();
        for mut entry in entries {
            self.begin_stop(&mut entry);
            if let Some(resources) = entry.resources {
                resources.capture.cancel();
                tabs.push(resources.tab);
            }
        }
        match self.session() {
            Some(connected) => {
                if let Err(err) = connected.session.close_all_tabs().await {
                    warn!(error = %err, "failed to close browser tabs");
                }
            }
            None => {
                for tab in tabs {
                    close_tab(tab.as_ref()).await;
                }
            }
        }
        if announce {
            info!("tabs cleared");
            self.sink.emit(SinkEvent::TabsCleared);
        }
    }

    fn handle_output(&self, test_id: &TestId, run_id: RunId, channel: LogChannel, decoded: Decoded) {
        self.with_runs(|runs| {
            let Some(entry) = find_run(runs, test_id, run_id) else {
                return;
            };
            let execution = &mut entry.execution;
            if !decoded.text.is_empty() {
                self.sink.emit(execution.record_output(channel, &decoded.text));
            }
            if let Some(lines) = decoded.lines {
                for event in self.config.parse_mode.parse(&lines) {
                    self.emit_all(execution.apply(&event));
                }
            }
        });
    }

    fn handle_exit(&self, test_id: &TestId, run_id: RunId, exit: &AgentExit) {
        self.with_runs(|runs| {
            let Some(entry) = find_run(runs, test_id, run_id) else {
                debug!(test_id = %test_id, run_id = %run_id, "exit for superseded run");
                return;
            };
            if let Some(resources) = &entry.resources {
                resources.capture.cancel();
            }
            info!(test_id = %test_id, run_id = %run_id, exit = ?exit, "agent exited");
            self.emit_all(entry.execution.finish(exit));
        });
        self.live.send_modify(|count| *count = count.saturating_sub(1));
    }

    fn handle_frame(&self, test_id: &TestId, run_id: RunId, data: String, url: Option<String>) {
        self.with_runs(|runs| {
            if find_run(runs, test_id, run_id).is_some() {
                self.sink.emit(SinkEvent::Screenshot {
                    test_id: test_id.clone(),
                    data,
                    timestamp: crate::model::timestamp_ms(),
                    url,
                });
            }
        });
    }
}

fn find_run<'a>(runs: &'a mut [RunEntry], test_id: &TestId, run_id: RunId) -> Option<&'a mut RunEntry> {
    runs.iter_mut().find(|entry| {
        entry.execution.test_id() == test_id && entry.execution.run_id() == run_id
    })
}

async fn close_tab(tab: &dyn BrowserTab) {
    if tab.is_closed() {
        return;
    }
    if let Err(err) = tab.close().await {
        warn!(target_id = %tab.target_id(), error = %err, "failed to close tab");
    }
}
