//! Agent configuration consumed by drivers and the environment builder.

mod helpers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use self::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Option key holding the comma-separated list of host environment variables
/// that are never propagated into tasks.
pub const ENV_DENYLIST_KEY: &str = "env.denylist";

/// Host variables withheld from tasks unless `env.denylist` overrides the list.
pub const DEFAULT_ENV_DENYLIST: &str = "CONSUL_TOKEN,VAULT_TOKEN,ATLAS_TOKEN,\
AWS_ACCESS_KEY_ID,AWS_SECRET_ACCESS_KEY,AWS_SESSION_TOKEN,GOOGLE_APPLICATION_CREDENTIALS";

/// Option key naming the task event sink backend (`log` or `noop`).
pub const EVENT_SINK_KEY: &str = "events.backend";

/// Environment variables mapped onto option keys by [`AgentConfig::from_env`].
const OPTION_ENV_VARS: &[(&str, &str)] = &[
    ("ENV_DENYLIST", ENV_DENYLIST_KEY),
    ("DRIVER_RAW_EXEC_ENABLE", "driver.raw_exec.enable"),
    ("DOCKER_CLEANUP_IMAGE", "docker.cleanup.image"),
    ("AGENT_EVENTS_BACKEND", EVENT_SINK_KEY),
];

/// Agent-wide configuration shared read-only by every driver.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding persisted task runner state.
    pub state_dir: PathBuf,
    /// Root under which allocation directories are created.
    pub alloc_dir: PathBuf,
    /// Upper bound applied to any task's kill timeout.
    pub max_kill_timeout: Duration,
    /// Free-form `key = value` driver options (e.g. `driver.raw_exec.enable`).
    pub options: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: default_data_dir().join("state"),
            alloc_dir: default_data_dir().join("alloc"),
            max_kill_timeout: Duration::from_secs(30),
            options: HashMap::new(),
        }
    }
}

/// Get the default data directory (~/.local/share/taskdriver on Linux).
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskdriver")
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Priority: env var > default. A `.env` file is loaded first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let mut options = HashMap::new();
        for (var, key) in OPTION_ENV_VARS {
            if let Some(value) = optional_env(var)? {
                options.insert((*key).to_string(), value);
            }
        }

        Ok(Self {
            state_dir: optional_env("AGENT_STATE_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            alloc_dir: optional_env("AGENT_ALLOC_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.alloc_dir),
            max_kill_timeout: Duration::from_secs(parse_optional_env(
                "AGENT_MAX_KILL_TIMEOUT_SECS",
                defaults.max_kill_timeout.as_secs(),
            )?),
            options,
        })
    }

    /// Set a single option, consuming and returning the config.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up an option.
    pub fn read(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Look up an option, falling back to `default` when unset.
    pub fn read_default(&self, key: &str, default: &str) -> String {
        self.read(key).unwrap_or(default).to_string()
    }

    /// Look up a boolean option, falling back to `default` when unset.
    pub fn read_bool_default(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.read(key) {
            None => Ok(default),
            Some(raw) => helpers::parse_bool(key, raw),
        }
    }

    /// Host environment variable names that must not reach tasks.
    pub fn env_denylist(&self) -> Vec<String> {
        self.read_default(ENV_DENYLIST_KEY, DEFAULT_ENV_DENYLIST)
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}
