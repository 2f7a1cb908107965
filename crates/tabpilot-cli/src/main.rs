//! Tabpilot CLI: parallel browser-test runner.
//!
//! Command-line interface for running workspace test folders, inspecting
//! captured agent logs, and listing tests.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes
#![allow(clippy::fn_params_excessive_bools)] // CLI flags are naturally bools

mod progress;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{miette, IntoDiagnostic, Result};
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabpilot::config::{load_config_file, CoordinatorConfig};
use tabpilot::coordinator::{Collaborators, ExecutionCoordinator};
use tabpilot::model::{Command, OutcomeStatus, TestDefinition, TestId};
use tabpilot::parser::{parse_bug_reports, parse_log_events, parse_log_events_basic};
use tabpilot::sink::{ChannelSink, EventSink, FanoutSink, TracingSink};
use tabpilot::store::{EnvironmentSelection, FixedEnvironment, TestStore, WorkspaceStore};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::progress::{status_label, ProgressRenderer};

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(name = "tabpilot", version, about = "Parallel browser-test runner")]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every test of a folder in parallel
    Run {
        #[arg(long, help = "Workspace directory containing .webtestpilot")]
        workspace: PathBuf,
        #[arg(
            long,
            help = "Folder to run, relative to the tests root (default: all tests)"
        )]
        folder: Option<String>,
        #[arg(long, conflicts_with = "folder", help = "Run only the test with this id")]
        test: Option<String>,
        #[arg(long, help = "Coordinator config file (.yaml, .yml or .json)")]
        config: Option<PathBuf>,
        #[arg(long, help = "Print events as NDJSON on stdout")]
        json: bool,
        #[arg(long, short, help = "Print every step and enable info logging")]
        verbose: bool,
        #[arg(long, help = "Environment id to pass to the agent")]
        environment: Option<String>,
        #[arg(long, help = "Override the browser CDP endpoint")]
        cdp_endpoint: Option<String>,
    },
    /// Decode a captured agent log and print its events
    Parse {
        #[arg(long, help = "Keep unmatched lines as `other` events")]
        basic: bool,
        #[arg(long)]
        json: bool,
        #[arg(help = "Log file (default: stdin)")]
        file: Option<PathBuf>,
    },
    /// List the tests of a workspace
    List {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Configure color output for miette diagnostics. Returns whether color is on.
fn configure_colors(mode: ColorMode) -> bool {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            // Respect NO_COLOR environment variable
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                // Check if stderr supports color (where we output diagnostics)
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };

    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
    use_color
}

/// Logs go to stderr. `RUST_LOG` wins over the `--verbose` default.
fn init_tracing(verbose: bool, color: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(color)
        .with_target(false)
        .try_init()
        .ok();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let color = configure_colors(cli.color);
    match cli.command {
        Commands::Run {
            workspace,
            folder,
            test,
            config,
            json,
            verbose,
            environment,
            cdp_endpoint,
        } => {
            init_tracing(verbose, color);
            cmd_run(RunArgs {
                workspace,
                folder,
                test,
                config,
                json,
                verbose,
                environment,
                cdp_endpoint,
                color,
            })
        }
        Commands::Parse { basic, json, file } => {
            init_tracing(false, color);
            cmd_parse(basic, json, file.as_deref())
        }
        Commands::List {
            workspace,
            folder,
            json,
        } => {
            init_tracing(false, color);
            cmd_list(&workspace, folder.as_deref(), json)
        }
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

struct RunArgs {
    workspace: PathBuf,
    folder: Option<String>,
    test: Option<String>,
    config: Option<PathBuf>,
    json: bool,
    verbose: bool,
    environment: Option<String>,
    cdp_endpoint: Option<String>,
    color: bool,
}

/// Handle the run command.
fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = match args.config.as_deref() {
        Some(path) => load_config_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(endpoint) = args.cdp_endpoint.clone() {
        config.cdp_endpoint = endpoint;
    }
    config.validate()?;

    let store = WorkspaceStore::open(&args.workspace)?;
    let environment = match args.environment.as_deref() {
        Some(id) => Some(
            store
                .environment(id)
                .ok_or_else(|| miette!("unknown environment: {id}"))?,
        ),
        None => None,
    };
    let (launch, folder_name) = match args.test.as_deref() {
        Some(id) => {
            let test_id = TestId::from(id);
            let test = store
                .test(&test_id)?
                .ok_or_else(|| miette!("unknown test: {id}"))?;
            let folder = test.full_path.parent().map(folder_name).unwrap_or_default();
            (Launch::Test(test_id), folder)
        }
        None => {
            let folder = resolve_folder(&store, args.folder.as_deref());
            let tests = store.tests_in_folder(&folder.display().to_string())?;
            if tests.is_empty() {
                eprintln!("no tests found in {}", folder.display());
                return Ok(());
            }
            (Launch::Batch(tests), folder_name(&folder))
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    let summary = runtime.block_on(run_batch(
        &args,
        config,
        Arc::new(store),
        Arc::new(FixedEnvironment::new(environment)),
        folder_name,
        launch,
    ))?;

    if !args.json {
        eprintln!("{}", summary.line());
    }
    if !summary.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_batch(
    args: &RunArgs,
    config: CoordinatorConfig,
    store: Arc<dyn TestStore>,
    environments: Arc<dyn EnvironmentSelection>,
    folder_name: String,
    launch: Launch,
) -> Result<Summary> {
    let total = launch.len();
    let endpoint = config.cdp_endpoint.clone();
    let (events_sink, mut events) = ChannelSink::new();
    let channel: Arc<dyn EventSink> = Arc::new(events_sink);
    let tracing_sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let coordinator = ExecutionCoordinator::new(
        config,
        Collaborators::local(store, environments),
        Arc::new(FanoutSink::new(vec![channel, tracing_sink])),
    );

    let json = args.json;
    let mut renderer = ProgressRenderer::new(args.color, args.verbose);
    let render = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(event) = events.recv().await {
            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    let _ = writeln!(stdout, "{line}");
                    let _ = stdout.flush();
                }
            } else {
                renderer.render(&event);
            }
        }
        renderer.finish();
    });

    let interrupted = Arc::new(AtomicBool::new(false));
    let (commands_tx, mut commands) = mpsc::unbounded_channel::<Inbound>();
    forward_stdin(commands_tx.clone());
    forward_interrupts(commands_tx);
    let dispatcher = {
        let coordinator = coordinator.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            while let Some(inbound) = commands.recv().await {
                match inbound {
                    Inbound::Command(command) => coordinator.dispatch(command).await,
                    Inbound::Interrupt => {
                        interrupted.store(true, Ordering::SeqCst);
                        let stopped = coordinator.interrupt();
                        info!(stopped, "interrupted, stopping runs");
                    }
                }
            }
        })
    };

    if let Err(err) = coordinator.connect(&endpoint, Some(folder_name)).await {
        dispatcher.abort();
        coordinator.dispose().await;
        drop(coordinator);
        let _ = render.await;
        return Err(err.into());
    }
    match launch {
        Launch::Batch(tests) => coordinator.start_batch(tests).await,
        Launch::Test(test_id) => {
            if let Err(err) = coordinator.start_test(&test_id).await {
                warn!(error = %err, "test could not be started");
            }
        }
    }
    if interrupted.load(Ordering::SeqCst) {
        // A launch may have been in flight when the interrupt landed.
        coordinator.stop_all_runs();
    }
    coordinator.wait_idle().await;

    let summary = Summary::from_runs(&coordinator, total);
    dispatcher.abort();
    let _ = dispatcher.await;
    coordinator.dispose().await;
    drop(coordinator);
    let _ = render.await;
    Ok(summary)
}

/// What `run` launches: a folder's tests or a single test looked up by id.
enum Launch {
    Batch(Vec<TestDefinition>),
    Test(TestId),
}

impl Launch {
    fn len(&self) -> usize {
        match self {
            Self::Batch(tests) => tests.len(),
            Self::Test(_) => 1,
        }
    }
}

/// Inbound message for the run loop.
enum Inbound {
    Command(Command),
    Interrupt,
}

/// NDJSON commands on stdin. Runs on a plain thread so a blocked read never
/// holds up runtime shutdown.
fn forward_stdin(commands: mpsc::UnboundedSender<Inbound>) {
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Command>(&line) {
                Ok(command) => {
                    debug!(?command, "stdin command");
                    if commands.send(Inbound::Command(command)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let err = tabpilot::Error::protocol(format!("invalid command: {err}"));
                    let received: String = line.chars().take(200).collect();
                    warn!(error = %err, %received, "ignoring stdin line");
                }
            }
        }
    });
}

fn forward_interrupts(commands: mpsc::UnboundedSender<Inbound>) {
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = commands.send(Inbound::Interrupt);
    }) {
        warn!(error = %err, "failed to install Ctrl-C handler");
    }
}

fn resolve_folder(store: &WorkspaceStore, folder: Option<&str>) -> PathBuf {
    match folder {
        None | Some("" | ".") => store.tests_root(),
        Some(folder) if Path::new(folder).is_absolute() => PathBuf::from(folder),
        Some(folder) => store.tests_root().join(folder),
    }
}

fn folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Final tally of a batch.
#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    passed: usize,
    failed: usize,
    stopped: usize,
    errored: usize,
    /// Tests that never reached a result (e.g. not launched after Ctrl-C).
    incomplete: usize,
}

impl Summary {
    fn from_runs(coordinator: &ExecutionCoordinator, total: usize) -> Self {
        let mut summary = Self::default();
        let runs = coordinator.snapshot();
        for run in &runs {
            match run.outcome().map(|outcome| outcome.status) {
                Some(OutcomeStatus::Passed) => summary.passed += 1,
                Some(OutcomeStatus::Failed) => summary.failed += 1,
                Some(OutcomeStatus::Stopped) => summary.stopped += 1,
                Some(OutcomeStatus::Errored) => summary.errored += 1,
                None => summary.incomplete += 1,
            }
        }
        summary.incomplete += total.saturating_sub(runs.len());
        summary
    }

    fn all_passed(&self) -> bool {
        self.failed == 0 && self.stopped == 0 && self.errored == 0 && self.incomplete == 0
    }

    fn line(&self) -> String {
        let mut parts = vec![
            format!("{} {}", self.passed, status_label(OutcomeStatus::Passed)),
            format!("{} {}", self.failed, status_label(OutcomeStatus::Failed)),
        ];
        if self.errored > 0 {
            parts.push(format!("{} {}", self.errored, status_label(OutcomeStatus::Errored)));
        }
        if self.stopped > 0 {
            parts.push(format!("{} {}", self.stopped, status_label(OutcomeStatus::Stopped)));
        }
        if self.incomplete > 0 {
            parts.push(format!("{} not run", self.incomplete));
        }
        parts.join(", ")
    }
}

/// Handle the parse command.
fn cmd_parse(basic: bool, json: bool, file: Option<&Path>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|err| tabpilot::Error::io(format!("failed to read {}", path.display()), err))?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text).into_diagnostic()?;
            text
        }
    };
    let events = if basic {
        parse_log_events_basic(&text)
    } else {
        parse_log_events(&text)
    };

    let mut stdout = io::stdout();
    if json {
        for event in &events {
            let payload = serde_json::to_string(event).into_diagnostic()?;
            writeln!(stdout, "{payload}").into_diagnostic()?;
        }
    } else {
        for event in &events {
            writeln!(stdout, "{}", event.display_message()).into_diagnostic()?;
        }
        let bugs = parse_bug_reports(&text);
        if !bugs.is_empty() {
            eprintln!("{} bug report(s)", bugs.len());
        }
    }
    Ok(())
}

/// Handle the list command.
fn cmd_list(workspace: &Path, folder: Option<&str>, json: bool) -> Result<()> {
    let store = WorkspaceStore::open(workspace)?;
    let folder = resolve_folder(&store, folder);
    let tests = store.tests_in_folder(&folder.display().to_string())?;
    let root = store.tests_root();

    let mut stdout = io::stdout();
    for test in &tests {
        let relative = test
            .full_path
            .strip_prefix(&root)
            .unwrap_or(&test.full_path)
            .display()
            .to_string();
        if json {
            let payload = serde_json::json!({
                "id": test.id,
                "name": test.name,
                "path": relative,
                "url": test.url,
                "steps": test.total_steps(),
            });
            writeln!(stdout, "{payload}").into_diagnostic()?;
        } else {
            writeln!(
                stdout,
                "{}\t{}\t{} steps\t{relative}",
                test.id,
                test.name,
                test.total_steps()
            )
            .into_diagnostic()?;
        }
    }
    Ok(())
}

/// Handle the completions command.
#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}
