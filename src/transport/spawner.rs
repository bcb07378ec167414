//! Agent process spawner.
//!
//! Builds the agent command line from [`EngineConfig`] and [`SessionOptions`]
//! and launches the child with:
//! - piped stdin/stdout/stderr;
//! - `kill_on_drop(true)` so an abandoned handle never leaks a process;
//! - optionally, `env_clear()` plus a small variable allowlist when
//!   `inherit_env = false`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::config::EngineConfig;
use crate::session::SessionOptions;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables kept when the parent environment is not inherited.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Flags selecting streaming JSON I/O and the stdio permission prompt.
pub const PROTOCOL_ARGS: &[&str] = &[
    "--output-format",
    "stream-json",
    "--input-format",
    "stream-json",
    "--verbose",
    "--permission-prompt-tool",
    "stdio",
];

// ── Command description ──────────────────────────────────────────────────────

/// Fully resolved description of an agent process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Executable.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Whether the parent environment is inherited.
    pub inherit_env: bool,
    /// Variables set on top of the (possibly cleared) environment.
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    /// Command for one agent process serving exactly one session.
    #[must_use]
    pub fn for_session(config: &EngineConfig, options: &SessionOptions) -> Self {
        let mut args = config.cli_args.clone();
        args.extend(PROTOCOL_ARGS.iter().map(|a| (*a).to_owned()));

        if let Some(model) = &options.model {
            args.extend(["--model".to_owned(), model.clone()]);
        }
        if let Some(mode) = &options.permission_mode {
            args.extend(["--permission-mode".to_owned(), mode.clone()]);
        }
        if let Some(turns) = options.max_turns {
            args.extend(["--max-turns".to_owned(), turns.to_string()]);
        }
        if let Some(budget) = options.max_budget_usd {
            args.extend(["--max-budget-usd".to_owned(), budget.to_string()]);
        }
        if let Some(token) = &options.resume {
            args.extend(["--resume".to_owned(), token.clone()]);
        }
        if options.include_partial_messages {
            args.push("--include-partial-messages".to_owned());
        }
        if !options.allowed_tools.is_empty() {
            args.extend(["--allowedTools".to_owned(), options.allowed_tools.join(",")]);
        }
        if !options.disallowed_tools.is_empty() {
            args.extend([
                "--disallowedTools".to_owned(),
                options.disallowed_tools.join(","),
            ]);
        }
        args.extend(options.extra_args.iter().cloned());

        let mut env = config.env.clone();
        env.extend(options.env.clone());

        Self {
            program: config.cli_path.clone(),
            args,
            cwd: options.cwd.clone(),
            inherit_env: config.inherit_env,
            env,
        }
    }

    /// Command for the shared broker process of the multiplexed topology.
    #[must_use]
    pub fn for_broker(config: &EngineConfig) -> Self {
        let mut args = config.cli_args.clone();
        args.extend(config.multiplex_args.iter().cloned());
        Self {
            program: config.cli_path.clone(),
            args,
            cwd: None,
            inherit_env: config.inherit_env,
            env: config.env.clone(),
        }
    }

    /// Build the `tokio` command for this description.
    #[must_use]
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if !self.inherit_env {
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
        }
        cmd.envs(&self.env);

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// A launched agent with its three pipes detached from the [`Child`].
#[derive(Debug)]
pub struct SpawnedAgent {
    /// Child process handle; owns the process (`kill_on_drop`).
    pub child: Child,
    /// Agent's stdin.
    pub stdin: ChildStdin,
    /// Agent's stdout.
    pub stdout: ChildStdout,
    /// Agent's stderr.
    pub stderr: ChildStderr,
}

/// Launch the process described by `spec`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")` on OS spawn failure.
/// - `AppError::Spawn("failed to capture agent …")` if a pipe is missing.
pub fn spawn_agent(spec: &SpawnSpec) -> Result<SpawnedAgent> {
    let mut child = spec.command().spawn().map_err(|err| AppError::Spawn {
        reason: format!("failed to spawn agent `{}`: {err}", spec.program),
        stderr: String::new(),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    info!(
        program = %spec.program,
        pid = child.id(),
        args = ?spec.args,
        "agent process spawned"
    );

    Ok(SpawnedAgent {
        child,
        stdin,
        stdout,
        stderr,
    })
}

fn missing_pipe(name: &str) -> AppError {
    AppError::Spawn {
        reason: format!("failed to capture agent {name}"),
        stderr: String::new(),
    }
}
