//! Test, fixture and environment lookup.
//!
//! [`WorkspaceStore`] reads the on-disk layout
//! `<root>/.webtestpilot/{.test,.fixture,.environment}`, one JSON file per
//! definition and arbitrary nesting of folders. A folder's id is its full path.

use crate::error::{Error, Result};
use crate::model::{
    EnvironmentDefinition, FixtureDefinition, TestAction, TestDefinition, TestId,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const WORKSPACE_DIR: &str = ".webtestpilot";
pub const TESTS_DIR: &str = ".test";
pub const FIXTURES_DIR: &str = ".fixture";
pub const ENVIRONMENTS_DIR: &str = ".environment";

pub trait TestStore: Send + Sync {
    fn test(&self, id: &TestId) -> Result<Option<TestDefinition>>;

    fn fixture(&self, id: &str) -> Result<Option<FixtureDefinition>>;

    /// Tests in a folder and its subfolders, direct children first.
    fn tests_in_folder(&self, folder_id: &str) -> Result<Vec<TestDefinition>>;

    fn update_test(&self, path: &Path, definition: &TestDefinition) -> Result<()>;
}

/// The environment currently selected for runs, if any.
pub trait EnvironmentSelection: Send + Sync {
    fn selected_environment(&self) -> Option<EnvironmentDefinition>;
}

#[derive(Clone, Debug, Default)]
pub struct FixedEnvironment {
    environment: Option<EnvironmentDefinition>,
}

impl FixedEnvironment {
    pub fn new(environment: Option<EnvironmentDefinition>) -> Self {
        Self { environment }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl EnvironmentSelection for FixedEnvironment {
    fn selected_environment(&self) -> Option<EnvironmentDefinition> {
        self.environment.clone()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestFile {
    id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    fixture_id: Option<String>,
    #[serde(default)]
    actions: Vec<TestAction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureFile {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    actions: Vec<TestAction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentFile {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    environment_variables: BTreeMap<String, String>,
}

/// Filesystem-backed store rooted at a workspace directory.
#[derive(Clone, Debug)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Open a workspace. Fails if `<root>/.webtestpilot` does not exist.
    pub fn open(workspace: impl AsRef<Path>) -> Result<Self> {
        let root = workspace.as_ref().join(WORKSPACE_DIR);
        if !root.is_dir() {
            return Err(Error::store(format!(
                "no {WORKSPACE_DIR} directory in {}",
                workspace.as_ref().display()
            )));
        }
        Ok(Self { root })
    }

    /// Create the directory layout if missing, then open it.
    pub fn initialize(workspace: impl AsRef<Path>) -> Result<Self> {
        let root = workspace.as_ref().join(WORKSPACE_DIR);
        for dir in [TESTS_DIR, FIXTURES_DIR, ENVIRONMENTS_DIR] {
            fs::create_dir_all(root.join(dir))
                .map_err(|err| Error::io("failed to create workspace directory", err))?;
        }
        Ok(Self { root })
    }

    pub fn tests_root(&self) -> PathBuf {
        self.root.join(TESTS_DIR)
    }

    pub fn fixtures_root(&self) -> PathBuf {
        self.root.join(FIXTURES_DIR)
    }

    pub fn environments_root(&self) -> PathBuf {
        self.root.join(ENVIRONMENTS_DIR)
    }

    /// Every test in the workspace.
    pub fn all_tests(&self) -> Result<Vec<TestDefinition>> {
        self.tests_in_folder(&self.tests_root().display().to_string())
    }

    pub fn environments(&self) -> Vec<EnvironmentDefinition> {
        walk_json(&self.environments_root())
            .into_iter()
            .filter_map(|path| load_environment(&path))
            .collect()
    }

    pub fn environment(&self, id: &str) -> Option<EnvironmentDefinition> {
        self.environments().into_iter().find(|env| env.id == id)
    }

    fn fixtures(&self) -> Vec<FixtureDefinition> {
        walk_json(&self.fixtures_root())
            .into_iter()
            .filter_map(|path| load_fixture(&path))
            .collect()
    }
}

impl TestStore for WorkspaceStore {
    fn test(&self, id: &TestId) -> Result<Option<TestDefinition>> {
        Ok(self
            .all_tests()?
            .into_iter()
            .find(|test| &test.id == id))
    }

    fn fixture(&self, id: &str) -> Result<Option<FixtureDefinition>> {
        Ok(self.fixtures().into_iter().find(|fixture| fixture.id == id))
    }

    fn tests_in_folder(&self, folder_id: &str) -> Result<Vec<TestDefinition>> {
        let folder = PathBuf::from(folder_id);
        if !folder.starts_with(self.tests_root()) || !folder.is_dir() {
            return Err(Error::store(format!("unknown test folder: {folder_id}")));
        }
        Ok(walk_json(&folder)
            .into_iter()
            .filter_map(|path| load_test(&path))
            .collect())
    }

    fn update_test(&self, path: &Path, definition: &TestDefinition) -> Result<()> {
        let data = serde_json::to_vec_pretty(definition)
            .map_err(|err| Error::io("failed to serialize test", err))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data).map_err(|err| Error::io("failed to write test file", err))?;
        fs::rename(&tmp, path).map_err(|err| Error::io("failed to replace test file", err))
    }
}

/// JSON files under `dir`: direct children first (sorted by name), then each
/// subfolder recursively.
fn walk_json(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "failed to read directory");
        return Vec::new();
    };
    let mut files = Vec::new();
    let mut folders = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            folders.push(path);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    folders.sort();
    for folder in folders {
        files.extend(walk_json(&folder));
    }
    files
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let parsed = fs::read_to_string(path)
        .map_err(|err| err.to_string())
        .and_then(|data| serde_json::from_str(&data).map_err(|err| err.to_string()));
    match parsed {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable definition");
            None
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn path_id(path: &Path) -> String {
    path.display().to_string()
}

fn load_test(path: &Path) -> Option<TestDefinition> {
    let file: TestFile = read_json(path)?;
    Some(TestDefinition {
        id: TestId::new(file.id.unwrap_or_else(|| path_id(path))),
        name: file.name.unwrap_or_else(|| file_stem(path)),
        url: file.url.filter(|url| !url.is_empty()),
        fixture_id: file.fixture_id.filter(|id| !id.is_empty()),
        actions: file.actions,
        full_path: path.to_path_buf(),
    })
}

fn load_fixture(path: &Path) -> Option<FixtureDefinition> {
    let file: FixtureFile = read_json(path)?;
    Some(FixtureDefinition {
        id: file.id.unwrap_or_else(|| path_id(path)),
        name: file.name.unwrap_or_else(|| file_stem(path)),
        actions: file.actions,
        full_path: path.to_path_buf(),
    })
}

fn load_environment(path: &Path) -> Option<EnvironmentDefinition> {
    let file: EnvironmentFile = read_json(path)?;
    Some(EnvironmentDefinition {
        id: file.id.unwrap_or_else(|| path_id(path)),
        name: file.name.unwrap_or_else(|| file_stem(path)),
        environment_variables: file.environment_variables,
        full_path: path.to_path_buf(),
    })
}

/// In-memory store. Folder ids are `/`-separated paths.
#[derive(Default)]
pub struct MemoryStore {
    tests: Mutex<Vec<(String, TestDefinition)>>,
    fixtures: Mutex<Vec<FixtureDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_test(self, folder: &str, test: TestDefinition) -> Self {
        if let Ok(mut tests) = self.tests.lock() {
            tests.push((folder.to_string(), test));
        }
        self
    }

    #[must_use]
    pub fn with_fixture(self, fixture: FixtureDefinition) -> Self {
        if let Ok(mut fixtures) = self.fixtures.lock() {
            fixtures.push(fixture);
        }
        self
    }

    fn lock_tests(&self) -> Result<std::sync::MutexGuard<'_, Vec<(String, TestDefinition)>>> {
        self.tests
            .lock()
            .map_err(|_| Error::store("test store poisoned"))
    }
}

impl TestStore for MemoryStore {
    fn test(&self, id: &TestId) -> Result<Option<TestDefinition>> {
        Ok(self
            .lock_tests()?
            .iter()
            .find(|(_, test)| &test.id == id)
            .map(|(_, test)| test.clone()))
    }

    fn fixture(&self, id: &str) -> Result<Option<FixtureDefinition>> {
        let fixtures = self
            .fixtures
            .lock()
            .map_err(|_| Error::store("fixture store poisoned"))?;
        Ok(fixtures.iter().find(|fixture| fixture.id == id).cloned())
    }

    fn tests_in_folder(&self, folder_id: &str) -> Result<Vec<TestDefinition>> {
        let tests = self.lock_tests()?;
        let nested_prefix = format!("{}/", folder_id.trim_end_matches('/'));
        let direct = tests.iter().filter(|(folder, _)| folder == folder_id);
        let mut nested: Vec<_> = tests
            .iter()
            .filter(|(folder, _)| folder.starts_with(&nested_prefix))
            .collect();
        nested.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(direct
            .chain(nested)
            .map(|(_, test)| test.clone())
            .collect())
    }

    fn update_test(&self, path: &Path, definition: &TestDefinition) -> Result<()> {
        let mut tests = self.lock_tests()?;
        let mut updated = definition.clone();
        updated.full_path = path.to_path_buf();
        if let Some(entry) = tests.iter_mut().find(|(_, test)| test.full_path == path) {
            entry.1 = updated;
        } else {
            let folder = path
                .parent()
                .map(|parent| parent.display().to_string())
                .unwrap_or_default();
            tests.push((folder, updated));
        }
        Ok(())
    }
}
