//! Many sessions over one shared broker process.
//!
//! # Architecture
//!
//! ```text
//!     broker stdout
//!          │
//!     router task ── route(frame) ── session.* ──▶ create table / registry
//!          │
//!          ├── session_id = A ──▶ SessionCore A ──▶ messages / callbacks
//!          └── session_id = B ──▶ SessionCore B ──▶ messages / callbacks
//! ```
//!
//! One background task reads the broker's frames in pipe order and hands each
//! to the dispatcher of the session it names, so per-session order is the
//! order in the raw stream. Frames for a session id that is not registered
//! yet (for example `system/init` racing `session.created`) wait in a bounded
//! per-id buffer and are replayed, in order, when the id is bound.
//!
//! Outbound per-session frames are wrapped in `session.message` envelopes.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{handshake_timeout, Backend, STDERR_SETTLE};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, SharedDiagnostics};
use crate::protocol::content::UserContent;
use crate::protocol::frame::{
    session_close, session_create, session_message, user_message, InboundFrame,
};
use crate::protocol::new_request_id;
use crate::session::dispatcher::{CoreChannels, SessionCore, SessionLink};
use crate::session::handshake::await_ready;
use crate::session::pending::{self, PendingKind, PendingTable};
use crate::session::{lock, Session, SessionOptions};
use crate::transport::spawner::SpawnSpec;
use crate::transport::{AgentExit, Transport};
use crate::{AppError, Result};

/// Frames held per not-yet-registered session id; older frames are dropped.
pub const EARLY_BUFFER_LIMIT: usize = 256;

/// Unregistered session ids buffered at once; the oldest id is evicted.
pub const EARLY_BUFFER_IDS: usize = 64;

#[derive(Default)]
struct RouteState {
    routes: HashMap<String, Arc<SessionCore>>,
    early: HashMap<String, VecDeque<Value>>,
    /// Buffered ids, oldest first.
    early_order: VecDeque<String>,
}

impl RouteState {
    fn take_early(&mut self, session_id: &str) -> VecDeque<Value> {
        self.early_order.retain(|id| id != session_id);
        self.early.remove(session_id).unwrap_or_default()
    }

    fn clear_early(&mut self) -> usize {
        self.early_order.clear();
        self.early.drain().map(|(_, queue)| queue.len()).sum()
    }
}

struct Router {
    config: EngineConfig,
    transport: Arc<Transport>,
    state: Mutex<RouteState>,
    sessions: Mutex<HashMap<String, Session>>,
    handshaking: Mutex<HashMap<String, Arc<SessionCore>>>,
    creates: PendingTable,
    errors_tx: mpsc::UnboundedSender<AppError>,
    diagnostics: SharedDiagnostics,
    disposed: AtomicBool,
}

impl Router {
    // ── Inbound routing ──────────────────────────────────────────────────────

    fn route(&self, frame: Value) {
        match frame.get("type").and_then(Value::as_str) {
            Some("session.created" | "session.error" | "session.message" | "session.closed") => {
                self.route_broker(InboundFrame::classify(frame));
            }
            _ => {
                let session_id = frame
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                match session_id {
                    Some(session_id) => self.deliver(&session_id, frame),
                    None => warn!(frame = %frame, "broker frame without session id dropped"),
                }
            }
        }
    }

    fn route_broker(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::SessionCreated {
                request_id,
                session_id,
            } => {
                debug!(request_id = %request_id, session_id = %session_id, "session.created");
                if !self.creates.complete(&request_id, Ok(Value::String(session_id))) {
                    self.correlation_miss(&request_id);
                }
            }
            InboundFrame::SessionError { request_id, error } => {
                warn!(request_id = %request_id, error = %error, "session.error");
                if !self.creates.complete(&request_id, Err(AppError::Control(error))) {
                    self.correlation_miss(&request_id);
                }
            }
            InboundFrame::SessionMessage {
                session_id,
                message,
            } => self.deliver(&session_id, message),
            InboundFrame::SessionClosed { session_id, reason } => {
                self.remote_closed(&session_id, reason);
            }
            InboundFrame::Malformed { reason, frame } => {
                warn!(reason = %reason, frame = %frame, "malformed broker frame dropped");
            }
            other => debug!(tag = other.tag(), "unexpected broker frame dropped"),
        }
    }

    fn deliver(&self, session_id: &str, frame: Value) {
        let mut state = lock(&self.state);
        if let Some(core) = state.routes.get(session_id).cloned() {
            drop(state);
            core.dispatch(frame);
            return;
        }

        // Only a create in flight can still bind an unknown id.
        if lock(&self.handshaking).is_empty() {
            debug!(session_id, "frame for unregistered session dropped");
            return;
        }

        if !state.early.contains_key(session_id) {
            if state.early_order.len() >= EARLY_BUFFER_IDS {
                if let Some(evicted) = state.early_order.pop_front() {
                    state.early.remove(&evicted);
                    warn!(session_id = %evicted, "early buffer id limit reached, evicting");
                }
            }
            state.early_order.push_back(session_id.to_owned());
        }
        let queue = state.early.entry(session_id.to_owned()).or_default();
        if queue.len() >= EARLY_BUFFER_LIMIT {
            warn!(session_id, "early buffer full, dropping oldest frame");
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    /// Drop buffered frames once no create can bind them.
    fn release_early_buffers(&self) {
        let mut state = lock(&self.state);
        if !state.early.is_empty() && lock(&self.handshaking).is_empty() {
            let dropped = state.clear_early();
            debug!(dropped, "unbound early frames released");
        }
    }

    fn early_buffered(&self) -> (usize, usize) {
        let state = lock(&self.state);
        let frames = state.early.values().map(VecDeque::len).sum();
        (state.early.len(), frames)
    }

    fn correlation_miss(&self, request_id: &str) {
        debug!(request_id, "broker answer for unknown request dropped");
        self.diagnostics.record(Diagnostic::new(
            None,
            DiagnosticKind::CorrelationMiss {
                request_id: request_id.to_owned(),
            },
        ));
    }

    // ── Registry ─────────────────────────────────────────────────────────────

    /// Register `core` under `session_id` and replay its buffered frames.
    fn bind(&self, session_id: &str, core: &Arc<SessionCore>) {
        core.bind_session_id(session_id);
        let mut state = lock(&self.state);
        state.routes.insert(session_id.to_owned(), core.clone());
        let buffered = state.take_early(session_id);
        debug!(session_id, replayed = buffered.len(), "session route bound");
        // Replayed under the lock so no live frame can overtake them.
        for frame in buffered {
            core.dispatch(frame);
        }
    }

    fn deregister(&self, session_id: &str) -> Option<Arc<SessionCore>> {
        let core = {
            let mut state = lock(&self.state);
            state.take_early(session_id);
            state.routes.remove(session_id)
        };
        lock(&self.sessions).remove(session_id);
        core
    }

    fn remote_closed(&self, session_id: &str, reason: Option<String>) {
        info!(session_id, reason = ?reason, "session closed by broker");
        if let Some(core) = self.deregister(session_id) {
            core.shutdown(reason.as_deref().unwrap_or("closed by broker"));
        }
    }

    fn broker_closed(&self, code: Option<i32>, stderr: &str) {
        let cores: Vec<Arc<SessionCore>> = {
            let mut state = lock(&self.state);
            state.clear_early();
            state.routes.drain().map(|(_, core)| core).collect()
        };
        let handshaking: Vec<Arc<SessionCore>> =
            lock(&self.handshaking).drain().map(|(_, core)| core).collect();
        lock(&self.sessions).clear();
        self.creates.fail_all("broker exited");

        if self.disposed.load(Ordering::SeqCst) {
            for core in cores.into_iter().chain(handshaking) {
                core.kill();
            }
            return;
        }

        warn!(code = ?code, sessions = cores.len(), "broker exited unexpectedly");
        if cores.is_empty() {
            let _ = self.errors_tx.send(AppError::UnexpectedExit {
                session_id: None,
                exit_code: code,
                stderr: stderr.to_owned(),
            });
        }
        for core in cores.into_iter().chain(handshaking) {
            core.transport_closed(code, stderr.to_owned());
        }
    }
}

struct MultiplexedLink {
    router: Weak<Router>,
}

impl MultiplexedLink {
    fn transport(&self) -> Result<Arc<Transport>> {
        self.router
            .upgrade()
            .map(|router| router.transport.clone())
            .ok_or_else(|| AppError::Disposed("broker released".into()))
    }
}

impl SessionLink for MultiplexedLink {
    fn send(&self, session_id: Option<&str>, frame: Value) -> Result<()> {
        let session_id = session_id.ok_or_else(|| {
            AppError::Protocol("session frame sent before the session id was bound".into())
        })?;
        self.transport()?.send(session_message(session_id, frame))
    }

    fn send_raw(&self, frame: Value) -> Result<()> {
        self.transport()?.send(frame)
    }

    fn close(&self, session_id: Option<&str>) {
        let (Some(router), Some(session_id)) = (self.router.upgrade(), session_id) else {
            return;
        };
        router.deregister(session_id);
        if !router.transport.is_killed() {
            if let Err(err) = router.transport.send(session_close(session_id)) {
                debug!(session_id, %err, "could not send session.close");
            }
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.router
            .upgrade()
            .and_then(|router| router.transport.exit())
            .and_then(|exit| exit.code)
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// Backend routing many sessions over one broker process.
pub struct MultiplexedBackend {
    router: Arc<Router>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<AppError>>>,
}

impl MultiplexedBackend {
    /// Start the broker (`cli_path` with `multiplex_args`).
    ///
    /// # Errors
    ///
    /// `AppError::Spawn` if the broker cannot be started.
    pub fn spawn(config: EngineConfig, diagnostics: SharedDiagnostics) -> Result<Self> {
        let spec = SpawnSpec::for_broker(&config);
        let transport = Transport::spawn(&spec, &config, diagnostics.clone())?;
        Self::from_transport(transport, config, diagnostics)
    }

    /// Route sessions over an existing transport.
    ///
    /// # Errors
    ///
    /// `AppError::Protocol` if the transport's inbound stream was already taken.
    pub fn from_transport(
        transport: Transport,
        config: EngineConfig,
        diagnostics: SharedDiagnostics,
    ) -> Result<Self> {
        let inbound = transport
            .take_inbound()
            .ok_or_else(|| AppError::Protocol("transport inbound stream already taken".into()))?;
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let router = Arc::new(Router {
            config,
            transport: Arc::new(transport),
            state: Mutex::new(RouteState::default()),
            sessions: Mutex::new(HashMap::new()),
            handshaking: Mutex::new(HashMap::new()),
            creates: PendingTable::new(),
            errors_tx,
            diagnostics,
            disposed: AtomicBool::new(false),
        });

        tokio::spawn(run_router(router.clone(), inbound));
        info!(broker = %router.transport.label(), "multiplexed backend started");

        Ok(Self {
            router,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }
}

impl MultiplexedBackend {
    /// Unregistered session ids and frames currently held for replay.
    #[must_use]
    pub fn early_buffered(&self) -> (usize, usize) {
        self.router.early_buffered()
    }
}

impl Backend for MultiplexedBackend {
    fn create_session(
        &self,
        options: SessionOptions,
        prompt: UserContent,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>> {
        Box::pin(create(self.router.clone(), options, prompt))
    }

    fn sessions(&self) -> Vec<Session> {
        lock(&self.router.sessions).values().cloned().collect()
    }

    fn session(&self, session_id: &str) -> Option<Session> {
        lock(&self.router.sessions).get(session_id).cloned()
    }

    fn dispose(&self) {
        if self.router.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handshaking: Vec<_> = lock(&self.router.handshaking)
            .drain()
            .map(|(_, core)| core)
            .collect();
        let sessions: Vec<_> = lock(&self.router.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect();
        info!(
            sessions = sessions.len(),
            handshaking = handshaking.len(),
            "disposing multiplexed backend"
        );
        for core in handshaking {
            core.kill();
        }
        for session in sessions {
            session.kill();
        }
        self.router.creates.fail_all("backend disposed");
        self.router.transport.kill();
    }

    fn is_disposed(&self) -> bool {
        self.router.disposed.load(Ordering::SeqCst)
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<AppError>> {
        lock(&self.errors_rx).take()
    }
}

impl Drop for MultiplexedBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_router(router: Arc<Router>, mut inbound: mpsc::UnboundedReceiver<Value>) {
    while let Some(frame) = inbound.recv().await {
        router.route(frame);
    }

    let exit = tokio::time::timeout(router.config.kill_grace(), router.transport.wait())
        .await
        .unwrap_or(AgentExit { code: None });
    let stderr = router.transport.settled_stderr_tail(STDERR_SETTLE).await;
    router.broker_closed(exit.code, &stderr);
}

async fn create(
    router: Arc<Router>,
    options: SessionOptions,
    prompt: UserContent,
) -> Result<Session> {
    if router.disposed.load(Ordering::SeqCst) {
        return Err(AppError::Disposed("backend disposed".into()));
    }

    let request_id = new_request_id();
    let created = router.creates.register(&request_id, PendingKind::Create)?;

    let link = Arc::new(MultiplexedLink {
        router: Arc::downgrade(&router),
    });
    let (core, channels) = SessionCore::new(
        format!("create:{request_id}"),
        link,
        Some(router.errors_tx.clone()),
        router.diagnostics.clone(),
    );
    let CoreChannels {
        messages,
        callbacks,
        init,
    } = channels;
    lock(&router.handshaking).insert(request_id.clone(), core.clone());

    let frame = session_create(
        &request_id,
        options.to_broker_options(),
        user_message(&prompt, None),
    );
    let result = match router.transport.send(frame) {
        Ok(()) => {
            core.handshake().init_sent();
            core.handshake().awaiting();
            let ack = async {
                let value = pending::wait(created).await?;
                let session_id = value.as_str().ok_or_else(|| {
                    AppError::Protocol("session.created without session id".into())
                })?;
                router.bind(session_id, &core);
                Ok::<Value, AppError>(value)
            };
            let timeout = handshake_timeout(&router.config, &options);
            await_ready(core.handshake(), ack, init, core.closed_token(), timeout).await
        }
        Err(err) => Err(err),
    };
    lock(&router.handshaking).remove(&request_id);
    router.creates.remove(&request_id);
    router.release_early_buffers();

    let init = match result {
        Ok((_, init)) => init,
        Err(err) => {
            let err = core.startup_error(err);
            warn!(request_id = %request_id, %err, "multiplexed session creation failed");
            core.kill();
            return Err(err);
        }
    };

    if router.disposed.load(Ordering::SeqCst) {
        core.kill();
        return Err(AppError::Disposed("backend disposed".into()));
    }

    let session = Session::new(core, init, messages, callbacks);
    lock(&router.sessions).insert(session.id().to_owned(), session.clone());
    info!(session_id = session.id(), "multiplexed session ready");
    Ok(session)
}
