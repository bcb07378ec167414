//! Engine configuration parsing, validation, and environment overrides.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

/// Environment variable overriding [`EngineConfig::cli_path`].
pub const ENV_CLI_PATH: &str = "AGENT_CONDUIT_CLI_PATH";
/// Environment variable overriding [`EngineConfig::debug`].
pub const ENV_DEBUG: &str = "AGENT_CONDUIT_DEBUG";
/// Environment variable overriding [`EngineConfig::log_file`].
pub const ENV_LOG_FILE: &str = "AGENT_CONDUIT_LOG_FILE";

fn default_cli_path() -> String {
    "claude".into()
}

fn default_multiplex_args() -> Vec<String> {
    vec!["--multiplex".into()]
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_stderr_capacity() -> usize {
    200
}

fn default_max_line_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Engine configuration parsed from `conduit.toml`.
///
/// Every key has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Agent executable.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Arguments placed before the protocol flags.
    #[serde(default)]
    pub cli_args: Vec<String>,
    /// Arguments selecting the multiplexed broker mode.
    #[serde(default = "default_multiplex_args")]
    pub multiplex_args: Vec<String>,
    /// Upper bound on the initialization handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
    /// Delay between SIGTERM and SIGKILL when killing an agent.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_millis: u64,
    /// Number of stderr lines retained per agent process.
    #[serde(default = "default_stderr_capacity")]
    pub stderr_capacity: usize,
    /// Longest inbound line accepted before it is discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Whether the child inherits the full parent environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Extra variables set on the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Debug-logging toggle.
    #[serde(default)]
    pub debug: bool,
    /// Log destination; stderr when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            cli_args: Vec::new(),
            multiplex_args: default_multiplex_args(),
            handshake_timeout_seconds: default_handshake_timeout(),
            kill_grace_millis: default_kill_grace(),
            stderr_capacity: default_stderr_capacity(),
            max_line_bytes: default_max_line_bytes(),
            inherit_env: true,
            env: HashMap::new(),
            debug: false,
            log_file: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENT_CONDUIT_*` environment overrides on top of the parsed values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override produces an invalid configuration.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = env::var(ENV_CLI_PATH) {
            if !path.trim().is_empty() {
                debug!(cli_path = %path, "config: cli path overridden from environment");
                self.cli_path = path;
            }
        }
        if let Ok(flag) = env::var(ENV_DEBUG) {
            self.debug = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Ok(file) = env::var(ENV_LOG_FILE) {
            if !file.trim().is_empty() {
                self.log_file = Some(PathBuf::from(file));
            }
        }
        self.validate()
    }

    /// Handshake bound as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    /// SIGTERM-to-SIGKILL grace as a [`Duration`].
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.cli_path.trim().is_empty() {
            return Err(AppError::Config("cli_path must not be empty".into()));
        }

        if self.handshake_timeout_seconds == 0 {
            return Err(AppError::Config(
                "handshake_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.stderr_capacity == 0 {
            return Err(AppError::Config(
                "stderr_capacity must be greater than zero".into(),
            ));
        }

        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
