//! Coordinator configuration.
//!
//! Loaded from YAML or JSON (chosen by file extension). Every field has a
//! default, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use crate::parser::ParseMode;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CDP_ENDPOINT: &str = "http://localhost:9222";
pub const DEFAULT_LAUNCH_DELAY_MS: u64 = 1000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 2000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Fixed wait between successive launches in a batch.
    pub launch_delay_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping a run.
    pub stop_grace_ms: u64,
    /// How long to wait for output readers after a process exits.
    pub drain_timeout_ms: u64,
    pub cdp_endpoint: String,
    pub parse_mode: ParseMode,
    pub agent: AgentConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            launch_delay_ms: DEFAULT_LAUNCH_DELAY_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            cdp_endpoint: DEFAULT_CDP_ENDPOINT.to_string(),
            parse_mode: ParseMode::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            return Err(Error::config("agent.program must not be empty"));
        }
        if self.stop_grace_ms == 0 {
            return Err(Error::config("stop_grace_ms must be greater than zero"));
        }
        if self.cdp_endpoint.trim().is_empty() {
            return Err(Error::config("cdp_endpoint must not be empty"));
        }
        Ok(())
    }
}

/// How the external test agent is invoked.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    /// Arguments placed before the test path (e.g. the agent's script).
    pub args: Vec<String>,
    pub config_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment. Configured entries are
    /// merged over the defaults (`BAML_LOG=info`), so a default is only
    /// replaced by naming its key.
    #[serde(deserialize_with = "merge_default_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["src/cli.py".to_string()],
            config_path: None,
            cwd: None,
            env: default_agent_env(),
        }
    }
}

fn default_agent_env() -> BTreeMap<String, String> {
    BTreeMap::from([("BAML_LOG".to_string(), "info".to_string())])
}

fn merge_default_env<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let configured = BTreeMap::<String, String>::deserialize(deserializer)?;
    let mut env = default_agent_env();
    env.extend(configured);
    Ok(env)
}

pub fn load_config_file(path: &Path) -> Result<CoordinatorConfig> {
    let data = fs::read_to_string(path).map_err(|err| {
        Error::io("failed to read config file", err)
    })?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml");
    let config: CoordinatorConfig = if is_yaml {
        serde_yml::from_str(&data).map_err(|err| {
            Error::config("failed to parse yaml config")
                .with_context(serde_json::json!({ "source": err.to_string() }))
        })?
    } else {
        serde_json::from_str(&data).map_err(|err| {
            Error::config("failed to parse json config")
                .with_context(serde_json::json!({ "source": err.to_string() }))
        })?
    };
    config.validate()?;
    Ok(config)
}
