//! One agent process per session.
//!
//! Session creation:
//! 1. launch a [`Transport`] (a real process, or anything a [`Launcher`]
//!    returns);
//! 2. start the frame pump feeding the session's dispatcher;
//! 3. send `initialize`, then the first user message without waiting;
//! 4. wait for both the `initialize` acknowledgment and `system/init`.
//!
//! Any failure kills the process. After the handshake, the process exiting
//! without an explicit kill is reported on the error stream.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{handshake_timeout, Backend, STDERR_SETTLE};
use crate::config::EngineConfig;
use crate::diagnostics::SharedDiagnostics;
use crate::protocol::content::UserContent;
use crate::protocol::frame::{control_request, user_message};
use crate::protocol::new_request_id;
use crate::session::dispatcher::{CoreChannels, SessionCore, SessionLink};
use crate::session::handshake::{await_ready, SessionInit};
use crate::session::pending::{self, PendingKind};
use crate::session::{lock, Session, SessionOptions};
use crate::transport::spawner::SpawnSpec;
use crate::transport::{AgentExit, Transport};
use crate::{AppError, Result};

// ── Launching ────────────────────────────────────────────────────────────────

/// Produces the transport for a new session.
pub trait Launcher: Send + Sync {
    /// Start the agent for one session.
    ///
    /// # Errors
    ///
    /// `AppError::Spawn` if the agent cannot be started.
    fn launch(&self, options: &SessionOptions) -> Result<Transport>;
}

/// Launches the configured agent executable.
#[derive(Clone)]
pub struct CommandLauncher {
    config: EngineConfig,
    diagnostics: SharedDiagnostics,
}

impl CommandLauncher {
    /// Launcher for `config.cli_path`.
    #[must_use]
    pub fn new(config: EngineConfig, diagnostics: SharedDiagnostics) -> Self {
        Self {
            config,
            diagnostics,
        }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, options: &SessionOptions) -> Result<Transport> {
        let spec = SpawnSpec::for_session(&self.config, options);
        Transport::spawn(&spec, &self.config, self.diagnostics.clone())
    }
}

struct ProcessLink {
    transport: Arc<Transport>,
}

impl SessionLink for ProcessLink {
    fn send(&self, _session_id: Option<&str>, frame: Value) -> Result<()> {
        self.transport.send(frame)
    }

    fn send_raw(&self, frame: Value) -> Result<()> {
        self.transport.send(frame)
    }

    fn close(&self, _session_id: Option<&str>) {
        self.transport.kill();
    }

    fn exit_code(&self) -> Option<i32> {
        self.transport.exit().and_then(|exit| exit.code)
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

struct Inner {
    config: EngineConfig,
    launcher: Arc<dyn Launcher>,
    diagnostics: SharedDiagnostics,
    sessions: Mutex<HashMap<String, Session>>,
    handshaking: Mutex<HashMap<u64, Arc<SessionCore>>>,
    next_ticket: AtomicU64,
    errors_tx: mpsc::UnboundedSender<AppError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<AppError>>>,
    disposed: AtomicBool,
}

/// Backend spawning one agent process per session.
pub struct ProcessBackend {
    inner: Arc<Inner>,
}

impl ProcessBackend {
    /// Backend launching `config.cli_path`.
    #[must_use]
    pub fn new(config: EngineConfig, diagnostics: SharedDiagnostics) -> Self {
        let launcher = Arc::new(CommandLauncher::new(config.clone(), diagnostics.clone()));
        Self::with_launcher(config, launcher, diagnostics)
    }

    /// Backend using a custom [`Launcher`].
    #[must_use]
    pub fn with_launcher(
        config: EngineConfig,
        launcher: Arc<dyn Launcher>,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                diagnostics,
                sessions: Mutex::new(HashMap::new()),
                handshaking: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                errors_tx,
                errors_rx: Mutex::new(Some(errors_rx)),
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

impl Backend for ProcessBackend {
    fn create_session(
        &self,
        options: SessionOptions,
        prompt: UserContent,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>> {
        Box::pin(create(self.inner.clone(), options, prompt))
    }

    fn sessions(&self) -> Vec<Session> {
        lock(&self.inner.sessions).values().cloned().collect()
    }

    fn session(&self, session_id: &str) -> Option<Session> {
        lock(&self.inner.sessions).get(session_id).cloned()
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handshaking: Vec<_> = lock(&self.inner.handshaking).drain().map(|(_, c)| c).collect();
        let sessions: Vec<_> = lock(&self.inner.sessions).drain().map(|(_, s)| s).collect();
        info!(
            sessions = sessions.len(),
            handshaking = handshaking.len(),
            "disposing process backend"
        );
        for core in handshaking {
            core.kill();
        }
        for session in sessions {
            session.kill();
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<AppError>> {
        lock(&self.inner.errors_rx).take()
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn disposed_error() -> AppError {
    AppError::Disposed("backend disposed".into())
}

async fn create(
    inner: Arc<Inner>,
    options: SessionOptions,
    prompt: UserContent,
) -> Result<Session> {
    if inner.disposed.load(Ordering::SeqCst) {
        return Err(disposed_error());
    }

    let transport = Arc::new(inner.launcher.launch(&options)?);
    let inbound = transport
        .take_inbound()
        .ok_or_else(|| AppError::Protocol("transport inbound stream already taken".into()))?;

    let link = Arc::new(ProcessLink {
        transport: transport.clone(),
    });
    let (core, channels) = SessionCore::new(
        transport.label().to_owned(),
        link,
        Some(inner.errors_tx.clone()),
        inner.diagnostics.clone(),
    );
    let CoreChannels {
        messages,
        callbacks,
        init,
    } = channels;

    tokio::spawn(pump(
        core.clone(),
        transport.clone(),
        inbound,
        inner.config.kill_grace(),
    ));

    let ticket = inner.next_ticket.fetch_add(1, Ordering::SeqCst);
    lock(&inner.handshaking).insert(ticket, core.clone());

    let timeout = handshake_timeout(&inner.config, &options);
    let result = handshake(&core, init, &options, &prompt, timeout).await;
    lock(&inner.handshaking).remove(&ticket);

    let init = match result {
        Ok(init) => init,
        Err(err) => {
            if matches!(err, AppError::Io(_) | AppError::Disposed(_)) {
                // Let the pump record the exit before classifying the failure.
                let _ = tokio::time::timeout(
                    inner.config.kill_grace(),
                    core.closed_token().cancelled(),
                )
                .await;
            }
            let err = core.startup_error(err);
            warn!(agent = %transport.label(), %err, "session creation failed");
            core.kill();
            return Err(err);
        }
    };

    if inner.disposed.load(Ordering::SeqCst) {
        core.kill();
        return Err(disposed_error());
    }

    let session = Session::new(core, init, messages, callbacks);
    lock(&inner.sessions).insert(session.id().to_owned(), session.clone());
    info!(session_id = session.id(), pid = ?transport.pid(), "session ready");

    tokio::spawn(deregister_on_close(Arc::downgrade(&inner), session.clone()));
    Ok(session)
}

async fn handshake(
    core: &SessionCore,
    init: tokio::sync::oneshot::Receiver<SessionInit>,
    options: &SessionOptions,
    prompt: &UserContent,
    timeout: Duration,
) -> Result<SessionInit> {
    let request_id = new_request_id();
    let ack = core.pending().register(&request_id, PendingKind::Create)?;

    core.send(control_request(
        &request_id,
        "initialize",
        options.initialize_fields(),
    ))?;
    core.handshake().init_sent();

    // The user message goes out before the acknowledgment arrives.
    core.send(user_message(prompt, None))?;
    core.handshake().awaiting();

    let (_, init) = await_ready(
        core.handshake(),
        pending::wait(ack),
        init,
        core.closed_token(),
        timeout,
    )
    .await?;
    Ok(init)
}

/// Feed every inbound frame to the dispatcher, then report the exit.
async fn pump(
    core: Arc<SessionCore>,
    transport: Arc<Transport>,
    mut inbound: mpsc::UnboundedReceiver<Value>,
    settle: Duration,
) {
    while let Some(frame) = inbound.recv().await {
        core.dispatch(frame);
    }

    let exit = tokio::time::timeout(settle, transport.wait())
        .await
        .unwrap_or(AgentExit { code: None });
    let stderr = transport.settled_stderr_tail(STDERR_SETTLE).await;
    debug!(agent = %transport.label(), code = ?exit.code, "agent output closed");
    core.transport_closed(exit.code, stderr);
}

async fn deregister_on_close(inner: Weak<Inner>, session: Session) {
    session.closed().await;
    if let Some(inner) = inner.upgrade() {
        lock(&inner.sessions).remove(session.id());
        debug!(session_id = session.id(), "session removed from registry");
    }
}
