//! Fluent builder APIs for constructing test fixtures.
//!
//! These builders reduce boilerplate when creating [`TestDefinition`] objects
//! and the [`AgentScript`]s replayed by the `tabpilot-fake-agent` binary.
//!
//! # Example
//!
//! ```ignore
//! use tabpilot_fixtures::{AgentScript, TestDefinitionBuilder};
//!
//! let test = TestDefinitionBuilder::new("checkout")
//!     .with_name("Checkout flow")
//!     .add_action("add item to cart", "cart shows 1 item")
//!     .build();
//!
//! let script = AgentScript::passing(1).stdout("Bug reported: price is wrong").exit(1);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tabpilot::model::{TestAction, TestDefinition, TestId};

// ============================================================================
// TestDefinitionBuilder
// ============================================================================

/// Fluent builder for constructing [`TestDefinition`] objects in tests.
///
/// The name defaults to the id and the URL to `https://example.test`.
#[derive(Debug, Clone)]
pub struct TestDefinitionBuilder {
    id: String,
    name: Option<String>,
    url: Option<String>,
    fixture_id: Option<String>,
    actions: Vec<TestAction>,
    full_path: PathBuf,
}

impl TestDefinitionBuilder {
    /// Create a builder for a test with the given id.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            url: Some("https://example.test".to_string()),
            fixture_id: None,
            actions: Vec::new(),
            full_path: PathBuf::from(format!("{id}.json")),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    #[must_use]
    pub fn without_url(mut self) -> Self {
        self.url = None;
        self
    }

    #[must_use]
    pub fn with_fixture(mut self, fixture_id: &str) -> Self {
        self.fixture_id = Some(fixture_id.to_string());
        self
    }

    /// Set the on-disk location. [`crate::write_test`] overrides this.
    #[must_use]
    pub fn with_full_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.full_path = path.into();
        self
    }

    /// Append one action/expectation pair.
    #[must_use]
    pub fn add_action(mut self, action: &str, expected_result: &str) -> Self {
        self.actions.push(TestAction {
            action: action.to_string(),
            expected_result: expected_result.to_string(),
        });
        self
    }

    #[must_use]
    pub fn build(self) -> TestDefinition {
        TestDefinition {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: TestId::new(self.id),
            url: self.url,
            fixture_id: self.fixture_id,
            actions: self.actions,
            full_path: self.full_path,
        }
    }
}

// ============================================================================
// AgentScript
// ============================================================================

/// One scripted action of the fake agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScriptStep {
    /// Print a line to stdout.
    Stdout { text: String },
    /// Print a line to stderr.
    Stderr { text: String },
    /// Sleep for the given number of milliseconds.
    Sleep { ms: u64 },
    /// Print the agent's own arguments to stdout as `ARGS: ...`.
    EchoArgs,
    /// Block until signalled.
    Hang,
}

/// Script replayed by the `tabpilot-fake-agent` binary.
///
/// Steps run in order, then the agent exits with `exit_code`.
/// With `ignore_term` set, SIGTERM/SIGINT are swallowed so only SIGKILL
/// ends the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentScript {
    pub steps: Vec<ScriptStep>,
    pub exit_code: i32,
    pub ignore_term: bool,
}

impl AgentScript {
    /// Empty script: exits 0 without output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for an agent that passes `steps` steps, each verified.
    #[must_use]
    pub fn passing(steps: u32) -> Self {
        let mut script = Self::new();
        for step in 1..=steps {
            script = script
                .stdout(&format!("STEP_{step}: action {step}"))
                .stdout(&format!("STEP_{step}_PASSED"))
                .stdout(&format!("VERIFYING_STEP_{step}: expectation {step}"))
                .stdout(&format!("VERIFYING_STEP_{step}_PASSED"));
        }
        script
    }

    #[must_use]
    pub fn stdout(mut self, text: &str) -> Self {
        self.steps.push(ScriptStep::Stdout {
            text: text.to_string(),
        });
        self
    }

    #[must_use]
    pub fn stderr(mut self, text: &str) -> Self {
        self.steps.push(ScriptStep::Stderr {
            text: text.to_string(),
        });
        self
    }

    #[must_use]
    pub fn sleep_ms(mut self, ms: u64) -> Self {
        self.steps.push(ScriptStep::Sleep { ms });
        self
    }

    #[must_use]
    pub fn echo_args(mut self) -> Self {
        self.steps.push(ScriptStep::EchoArgs);
        self
    }

    #[must_use]
    pub fn hang(mut self) -> Self {
        self.steps.push(ScriptStep::Hang);
        self
    }

    #[must_use]
    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    #[must_use]
    pub fn ignore_term(mut self) -> Self {
        self.ignore_term = true;
        self
    }

    /// Write the script as JSON, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics if serialization or file writing fails.
    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create script directory");
        }
        let data = serde_json::to_vec_pretty(self).expect("failed to serialize agent script");
        fs::write(path, data).expect("failed to write agent script");
    }

    /// Read a script written by [`AgentScript::write`].
    pub fn load(path: &Path) -> Result<Self, String> {
        let data = fs::read(path).map_err(|err| format!("{}: {err}", path.display()))?;
        serde_json::from_slice(&data).map_err(|err| format!("{}: {err}", path.display()))
    }
}
