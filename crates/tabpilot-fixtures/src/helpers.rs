//! Common test helper functions.
//!
//! These utilities reduce boilerplate in integration tests by providing
//! standard implementations for temp directories and for laying out a
//! `.webtestpilot` workspace on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tabpilot::config::CoordinatorConfig;
use tabpilot::model::{EnvironmentDefinition, FixtureDefinition, TestDefinition};
use tabpilot::store::WorkspaceStore;

/// Create a unique temporary directory for a test.
///
/// The directory name includes a timestamp and the process id to avoid
/// collisions between parallel test runs. The directory is created
/// immediately.
///
/// # Arguments
///
/// * `prefix` - A short identifier for the test (e.g., "stop", "folder")
///
/// # Panics
///
/// Panics if the directory cannot be created.
///
/// # Example
///
/// ```ignore
/// let dir = temp_dir("my-test");
/// // dir is something like /tmp/tabpilot-my-test-4242-1703520000000
/// ```
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("tabpilot-{prefix}-{}-{stamp}", std::process::id()));

    #[allow(clippy::expect_used)]
    fs::create_dir_all(&dir).expect("failed to create temp directory");

    dir
}

/// Create the `.webtestpilot` layout under `root` and open it.
///
/// # Panics
///
/// Panics if the directories cannot be created.
///
/// # Example
///
/// ```ignore
/// let store = workspace(&temp_dir("layout"));
/// assert!(store.tests_root().ends_with(".webtestpilot/.test"));
/// ```
#[must_use]
pub fn workspace(root: &Path) -> WorkspaceStore {
    WorkspaceStore::initialize(root).expect("failed to initialize workspace")
}

/// Write a test definition under the workspace's tests root.
///
/// `relative` may include folders (e.g. `"auth/login.json"`); missing
/// folders are created. Returns the absolute path of the written file.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
pub fn write_test(store: &WorkspaceStore, relative: &str, test: &TestDefinition) -> PathBuf {
    let path = store.tests_root().join(relative);
    write_json(&path, test);
    path
}

/// Write a fixture definition under the workspace's fixtures root.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
pub fn write_fixture(store: &WorkspaceStore, fixture: &FixtureDefinition) -> PathBuf {
    let path = store.fixtures_root().join(format!("{}.json", fixture.id));
    write_json(&path, fixture);
    path
}

/// Write an environment definition under the workspace's environments root.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
pub fn write_environment(store: &WorkspaceStore, environment: &EnvironmentDefinition) -> PathBuf {
    let path = store
        .environments_root()
        .join(format!("{}.json", environment.id));
    write_json(&path, environment);
    path
}

/// Write a coordinator config, as YAML when the extension is `.yaml`/`.yml`
/// and as JSON otherwise.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
///
/// # Example
///
/// ```ignore
/// let mut config = CoordinatorConfig::default();
/// config.agent.program = "/bin/sh".into();
/// write_config(&dir.join("tabpilot.yaml"), &config);
/// ```
pub fn write_config(path: &Path, config: &CoordinatorConfig) {
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml {
        #[allow(clippy::expect_used)]
        let data = serde_yml::to_string(config).expect("failed to serialize config");
        #[allow(clippy::expect_used)]
        fs::write(path, data).expect("failed to write config file");
    } else {
        write_json(path, config);
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
    if let Some(parent) = path.parent() {
        #[allow(clippy::expect_used)]
        fs::create_dir_all(parent).expect("failed to create parent directory");
    }
    #[allow(clippy::expect_used)]
    let data = serde_json::to_vec_pretty(value).expect("failed to serialize fixture");
    #[allow(clippy::expect_used)]
    fs::write(path, data).expect("failed to write fixture file");
}
