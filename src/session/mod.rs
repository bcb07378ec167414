//! Sessions: one conversation with an agent.
//!
//! A [`Session`] is handed out by a [`Backend`](crate::backend::Backend) only
//! after the handshake completed, so its id and [`SessionInit`] snapshot are
//! always available. Handles are cheap to clone and all refer to the same
//! session.
//!
//! Submodules:
//! - `pending`: request-id correlation table.
//! - `handshake`: readiness state machine.
//! - `dispatcher`: per-frame routing and teardown.
//! - `callback`: permission and hook requests.
//! - `message`: outward message types.
//! - `options`: per-session options.

pub mod callback;
pub(crate) mod dispatcher;
pub mod handshake;
pub mod message;
pub mod options;
pub mod pending;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::content::UserContent;
use crate::protocol::frame::user_message;
use crate::{AppError, Result};

pub use callback::{CallbackRequest, HookRequest, PermissionRequest};
pub use handshake::{HandshakeState, SessionInit};
pub use message::{SessionMessage, TurnResult};
pub use options::SessionOptions;
pub use pending::PendingKind;

use dispatcher::SessionCore;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionInner {
    core: Arc<SessionCore>,
    init: SessionInit,
    messages: Mutex<Option<mpsc::UnboundedReceiver<SessionMessage>>>,
    callbacks: Mutex<Option<mpsc::UnboundedReceiver<CallbackRequest>>>,
}

/// Handle to one ready session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        init: SessionInit,
        messages: mpsc::UnboundedReceiver<SessionMessage>,
        callbacks: mpsc::UnboundedReceiver<CallbackRequest>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                core,
                init,
                messages: Mutex::new(Some(messages)),
                callbacks: Mutex::new(Some(callbacks)),
            }),
        }
    }

    /// Agent-assigned session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.init.session_id
    }

    /// Capability snapshot from the handshake.
    #[must_use]
    pub fn init(&self) -> &SessionInit {
        &self.inner.init
    }

    /// Take the outward message stream. `None` after the first call.
    ///
    /// Frames received during the handshake, including `system/init`, are
    /// already queued. The stream ends when the session is torn down.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<SessionMessage>> {
        lock(&self.inner.messages).take()
    }

    /// Take the callback stream. `None` after the first call.
    ///
    /// Callbacks that arrive before the stream is taken are queued and
    /// delivered once it is. After the stream (or every session handle) is
    /// dropped, new callbacks are refused automatically.
    pub fn take_callbacks(&self) -> Option<mpsc::UnboundedReceiver<CallbackRequest>> {
        lock(&self.inner.callbacks).take()
    }

    /// Whether the session is still usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.core.is_alive()
    }

    /// Exit code of the agent process, once it has exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.core.exit_code()
    }

    /// Resolves once the session has been torn down, for any reason.
    pub async fn closed(&self) {
        self.inner.core.closed_token().cancelled().await;
    }

    /// Send a text user message.
    ///
    /// # Errors
    ///
    /// - `AppError::Disposed` if the session is closed.
    /// - Transport errors if the frame cannot be queued.
    pub fn send(&self, text: &str) -> Result<()> {
        self.send_content(UserContent::from(text))
    }

    /// Send a user message made of content blocks.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_with_content(&self, blocks: Vec<Value>) -> Result<()> {
        self.send_content(UserContent::Blocks(blocks))
    }

    /// Send a user message.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_content(&self, content: UserContent) -> Result<()> {
        self.inner
            .core
            .send(user_message(&content, Some(self.id())))
    }

    /// Ask the agent to stop the current turn.
    ///
    /// A no-op on a session that is already closed, including one that closes
    /// while the request is in flight.
    ///
    /// # Errors
    ///
    /// `AppError::Control` if the agent rejects the request.
    pub async fn interrupt(&self) -> Result<()> {
        if !self.is_alive() {
            debug!(session_id = self.id(), "interrupt on closed session ignored");
            return Ok(());
        }
        match self
            .inner
            .core
            .call("interrupt", Map::new(), PendingKind::Control)
            .await
        {
            Ok(_) | Err(AppError::Disposed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Switch model; `None` restores the default.
    ///
    /// # Errors
    ///
    /// - `AppError::Disposed` if the session closes first.
    /// - `AppError::Control` if the agent rejects the request.
    pub async fn set_model(&self, model: Option<&str>) -> Result<()> {
        let mut fields = Map::new();
        fields.insert(
            "model".to_owned(),
            model.map_or(Value::Null, |m| Value::String(m.to_owned())),
        );
        self.inner
            .core
            .call("set_model", fields, PendingKind::Control)
            .await
            .map(|_| ())
    }

    /// Switch permission mode.
    ///
    /// # Errors
    ///
    /// As [`set_model`](Self::set_model).
    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("mode".to_owned(), Value::String(mode.to_owned()));
        self.inner
            .core
            .call("set_permission_mode", fields, PendingKind::Control)
            .await
            .map(|_| ())
    }

    /// Send an arbitrary control request and return its payload.
    ///
    /// # Errors
    ///
    /// As [`set_model`](Self::set_model).
    pub async fn query(&self, subtype: &str, fields: Map<String, Value>) -> Result<Value> {
        self.inner
            .core
            .call(subtype, fields, PendingKind::Query)
            .await
    }

    /// Kill the session. Idempotent.
    ///
    /// Pending administrative calls fail with `AppError::Disposed`, unanswered
    /// callbacks are abandoned, and both outward streams end.
    pub fn kill(&self) {
        self.inner.core.kill();
    }
}
