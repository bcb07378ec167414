//! Session backends.
//!
//! The [`Backend`] trait is the one surface application code uses to create,
//! list and dispose of sessions, whichever transport topology is active:
//! - [`process::ProcessBackend`]: one agent process per session;
//! - [`multiplexed::MultiplexedBackend`]: one broker process, sessions routed
//!   by session id.
//!
//! Both run the same handshake, dispatcher and callback router; they differ
//! only in how a session's frames reach the agent.

pub mod multiplexed;
pub mod process;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::diagnostics::SharedDiagnostics;
use crate::protocol::content::UserContent;
use crate::session::{Session, SessionOptions};
use crate::{AppError, Result};

/// Upper bound on waiting for stderr to drain after an agent exits.
pub(crate) const STDERR_SETTLE: Duration = Duration::from_millis(250);

/// Topology-independent session management.
pub trait Backend: Send + Sync {
    /// Start a session, send `prompt` as its first user message, and return
    /// it once the handshake has completed.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the agent fails to start or exits first.
    /// - `AppError::HandshakeTimeout` if readiness is not reached in time.
    /// - `AppError::Disposed` if the backend is disposed.
    fn create_session(
        &self,
        options: SessionOptions,
        prompt: UserContent,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>>;

    /// Live sessions.
    fn sessions(&self) -> Vec<Session>;

    /// Look up a live session by id.
    fn session(&self, session_id: &str) -> Option<Session>;

    /// Kill the live session `session_id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` if no live session has that id.
    fn kill_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        session.kill();
        Ok(())
    }

    /// Kill every session and release the transport. Idempotent.
    fn dispose(&self);

    /// Whether [`dispose`](Self::dispose) has been called.
    fn is_disposed(&self) -> bool;

    /// Take the stream of asynchronous backend errors, chiefly
    /// [`AppError::UnexpectedExit`]. `None` after the first call.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<AppError>>;
}

/// Build the backend selected by `multiplexed`.
///
/// # Errors
///
/// `AppError::Spawn` if the multiplexed broker cannot be started.
pub fn from_config(
    config: EngineConfig,
    multiplexed: bool,
    diagnostics: SharedDiagnostics,
) -> Result<Box<dyn Backend>> {
    if multiplexed {
        Ok(Box::new(multiplexed::MultiplexedBackend::spawn(
            config,
            diagnostics,
        )?))
    } else {
        Ok(Box::new(process::ProcessBackend::new(config, diagnostics)))
    }
}

/// Handshake bound for `options`, falling back to the engine default.
pub(crate) fn handshake_timeout(config: &EngineConfig, options: &SessionOptions) -> Duration {
    options
        .handshake_timeout
        .unwrap_or_else(|| config.handshake_timeout())
}
