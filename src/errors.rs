//! Error types shared across the engine.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering every protocol and lifecycle failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The agent process failed to start or exited before the session was ready.
    Spawn {
        /// What went wrong.
        reason: String,
        /// Captured stderr tail, possibly empty.
        stderr: String,
    },
    /// The handshake did not observe every readiness condition in time.
    HandshakeTimeout {
        /// The bound that elapsed.
        timeout: Duration,
        /// Names of the conditions still outstanding.
        missing: Vec<&'static str>,
    },
    /// One inbound line was not valid JSON.
    FrameParse(String),
    /// A correlated frame referenced an unknown request id.
    CorrelationMiss(String),
    /// A callback request was answered more than once.
    AlreadyResponded(String),
    /// The session or backend was killed or disposed.
    Disposed(String),
    /// The agent process terminated after the session became ready.
    UnexpectedExit {
        /// Session bound to the process, if known.
        session_id: Option<String>,
        /// Exit code, `None` when terminated by a signal.
        exit_code: Option<i32>,
        /// Captured stderr tail, possibly empty.
        stderr: String,
    },
    /// A recognised frame was missing a required field.
    Protocol(String),
    /// The agent answered an administrative request with an error.
    Control(String),
    /// Requested session does not exist.
    NotFound(String),
    /// Pipe or process I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn { reason, stderr } => {
                write!(f, "spawn failure: {reason}")?;
                if !stderr.is_empty() {
                    write!(f, "\nstderr:\n{stderr}")?;
                }
                Ok(())
            }
            Self::HandshakeTimeout { timeout, missing } => write!(
                f,
                "handshake timeout after {timeout:?}: missing {}",
                missing.join(" and ")
            ),
            Self::FrameParse(msg) => write!(f, "frame parse: {msg}"),
            Self::CorrelationMiss(msg) => write!(f, "correlation miss: {msg}"),
            Self::AlreadyResponded(msg) => write!(f, "already responded: {msg}"),
            Self::Disposed(msg) => write!(f, "disposed: {msg}"),
            Self::UnexpectedExit {
                session_id,
                exit_code,
                stderr,
            } => {
                let session = session_id.as_deref().unwrap_or("<unbound>");
                match exit_code {
                    Some(code) => write!(f, "agent for session {session} exited with code {code}")?,
                    None => write!(f, "agent for session {session} terminated by signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, "\nstderr:\n{stderr}")?;
                }
                Ok(())
            }
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::FrameParse(err.to_string())
    }
}
