//! Per-session frame dispatch and teardown.
//!
//! [`SessionCore`] is the state one session shares between its consumer-facing
//! [`Session`](crate::session::Session) handle, the task feeding it frames,
//! and its outstanding callbacks. [`SessionCore::dispatch`] classifies each
//! frame and routes it to the message stream, the pending-request table, or
//! the callback stream. Dispatch is synchronous and never fails: bad frames
//! are logged, reported as diagnostics, and forwarded opaquely.
//!
//! The topology-specific part, how frames reach the agent, sits behind
//! [`SessionLink`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::diagnostics::{Diagnostic, DiagnosticKind, SharedDiagnostics};
use crate::protocol::frame::{
    callback_response, control_error, control_request, control_success, CallbackKind,
    ControlOutcome, InboundFrame,
};
use crate::protocol::new_request_id;
use crate::session::callback::{CallbackRequest, CallbackRoute, HookRequest, PermissionRequest};
use crate::session::handshake::{HandshakeTracker, SessionInit};
use crate::session::lock;
use crate::session::message::{SessionMessage, TurnResult};
use crate::session::pending::{self, PendingKind, PendingTable};
use crate::{AppError, Result};

/// Outbound half of one session, provided by the backend topology.
pub(crate) trait SessionLink: Send + Sync {
    /// Write one per-session frame.
    fn send(&self, session_id: Option<&str>, frame: Value) -> Result<()>;
    /// Write one frame unwrapped on the underlying transport.
    fn send_raw(&self, frame: Value) -> Result<()>;
    /// Release the session's share of the transport. Called once, on kill.
    fn close(&self, session_id: Option<&str>);
    /// Exit code of the process behind the session, once known.
    fn exit_code(&self) -> Option<i32>;
}

/// How the agent side went away before an explicit kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub(crate) code: Option<i32>,
    pub(crate) stderr: String,
}

/// Receivers created alongside a [`SessionCore`].
pub(crate) struct CoreChannels {
    pub(crate) messages: mpsc::UnboundedReceiver<SessionMessage>,
    pub(crate) callbacks: mpsc::UnboundedReceiver<CallbackRequest>,
    pub(crate) init: oneshot::Receiver<SessionInit>,
}

/// Shared state of one session.
pub(crate) struct SessionCore {
    label: String,
    session_id: OnceLock<String>,
    link: Arc<dyn SessionLink>,
    pending: PendingTable,
    handshake: HandshakeTracker,
    messages: Mutex<Option<mpsc::UnboundedSender<SessionMessage>>>,
    callbacks: Mutex<Option<mpsc::UnboundedSender<CallbackRequest>>>,
    init_tx: Mutex<Option<oneshot::Sender<SessionInit>>>,
    alive: AtomicBool,
    killed: AtomicBool,
    closed: CancellationToken,
    exit: OnceLock<ExitInfo>,
    errors: Option<mpsc::UnboundedSender<AppError>>,
    diagnostics: SharedDiagnostics,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("label", &self.label)
            .field("session_id", &self.session_id.get())
            .field("alive", &self.is_alive())
            .field("handshake", &self.handshake.state())
            .finish_non_exhaustive()
    }
}

impl SessionCore {
    pub(crate) fn new(
        label: String,
        link: Arc<dyn SessionLink>,
        errors: Option<mpsc::UnboundedSender<AppError>>,
        diagnostics: SharedDiagnostics,
    ) -> (Arc<Self>, CoreChannels) {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (callbacks_tx, callbacks) = mpsc::unbounded_channel();
        let (init_tx, init) = oneshot::channel();

        let core = Arc::new(Self {
            label,
            session_id: OnceLock::new(),
            link,
            pending: PendingTable::new(),
            handshake: HandshakeTracker::new(),
            messages: Mutex::new(Some(messages_tx)),
            callbacks: Mutex::new(Some(callbacks_tx)),
            init_tx: Mutex::new(Some(init_tx)),
            alive: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            exit: OnceLock::new(),
            errors,
            diagnostics,
        });

        (
            core,
            CoreChannels {
                messages,
                callbacks,
                init,
            },
        )
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    fn log_id(&self) -> &str {
        self.session_id().unwrap_or(&self.label)
    }

    /// Bind the agent-assigned id. The first binding wins.
    pub(crate) fn bind_session_id(&self, session_id: &str) {
        if self.session_id.set(session_id.to_owned()).is_err()
            && self.session_id() != Some(session_id)
        {
            warn!(
                bound = self.log_id(),
                announced = session_id,
                "session id changed after binding, keeping the first"
            );
        }
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn handshake(&self) -> &HandshakeTracker {
        &self.handshake
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit
            .get()
            .and_then(|exit| exit.code)
            .or_else(|| self.link.exit_code())
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Write one per-session frame.
    pub(crate) fn send(&self, frame: Value) -> Result<()> {
        if !self.is_alive() {
            return Err(AppError::Disposed(format!("session {} is closed", self.log_id())));
        }
        self.link.send(self.session_id(), frame)
    }

    /// Send a `control_request` and wait for its correlated answer.
    ///
    /// No timeout of its own: resolved by the agent's answer or by teardown.
    pub(crate) async fn call(
        &self,
        subtype: &str,
        fields: Map<String, Value>,
        kind: PendingKind,
    ) -> Result<Value> {
        let request_id = new_request_id();
        let rx = self.pending.register(&request_id, kind)?;
        debug!(
            session_id = self.log_id(),
            request_id = %request_id,
            subtype,
            "sending control request"
        );

        if let Err(err) = self.send(control_request(&request_id, subtype, fields)) {
            self.pending.remove(&request_id);
            return Err(err);
        }
        pending::wait(rx).await
    }

    pub(crate) fn answer_callback(&self, route: &CallbackRoute, response: Value) -> Result<()> {
        match route {
            CallbackRoute::Control { request_id } => {
                self.send(control_success(request_id, response))
            }
            CallbackRoute::Broker { callback_id } => {
                let session_id = self.session_id().ok_or_else(|| {
                    AppError::Protocol("callback answered before session id was bound".into())
                })?;
                self.link
                    .send_raw(callback_response(session_id, callback_id, response))
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Route one inbound frame. Never fails.
    pub(crate) fn dispatch(self: &Arc<Self>, frame: Value) {
        if !self.is_alive() {
            trace!(session_id = self.log_id(), "frame after teardown dropped");
            return;
        }

        match InboundFrame::classify(frame) {
            InboundFrame::System { subtype, frame } => {
                if subtype.as_deref() == Some("init") {
                    self.complete_init(&frame);
                }
                self.forward(SessionMessage::System {
                    subtype,
                    raw: frame,
                });
            }
            InboundFrame::Assistant(frame) => self.forward(SessionMessage::Assistant(frame)),
            InboundFrame::User(frame) => self.forward(SessionMessage::User(frame)),
            InboundFrame::StreamEvent(frame) => self.forward(SessionMessage::StreamEvent(frame)),
            InboundFrame::Result(frame) => {
                let result = TurnResult::from_frame(frame);
                debug!(
                    session_id = self.log_id(),
                    subtype = ?result.subtype,
                    is_error = result.is_error,
                    "turn complete"
                );
                self.forward(SessionMessage::Result(result));
            }
            InboundFrame::ControlRequest {
                request_id,
                subtype,
                request,
                frame,
            } => self.on_control_request(request_id, &subtype, &request, frame),
            InboundFrame::ControlResponse {
                request_id,
                outcome,
            }
            | InboundFrame::QueryResult {
                request_id,
                outcome,
                ..
            } => self.resolve(&request_id, outcome),
            InboundFrame::CallbackRequest {
                callback_id,
                kind,
                frame,
                ..
            } => {
                let route = CallbackRoute::Broker { callback_id };
                let body = frame.get("request").filter(|r| r.is_object()).unwrap_or(&frame);
                let request = match kind {
                    CallbackKind::CanUseTool => CallbackRequest::Permission(
                        PermissionRequest::new(self.clone(), route, body),
                    ),
                    CallbackKind::Hook => {
                        CallbackRequest::Hook(HookRequest::new(self.clone(), route, body))
                    }
                };
                self.emit_callback(request);
            }
            InboundFrame::Malformed { reason, frame } => {
                warn!(
                    session_id = self.log_id(),
                    reason = %reason,
                    "malformed frame forwarded as opaque"
                );
                self.forward_opaque(frame);
            }
            other @ (InboundFrame::SessionCreated { .. }
            | InboundFrame::SessionError { .. }
            | InboundFrame::SessionMessage { .. }
            | InboundFrame::SessionClosed { .. }) => {
                debug!(
                    session_id = self.log_id(),
                    tag = other.tag(),
                    "broker frame reached a session, dropped"
                );
            }
            InboundFrame::Unknown { frame_type, frame } => {
                debug!(
                    session_id = self.log_id(),
                    frame_type = ?frame_type,
                    "unrecognised frame forwarded"
                );
                self.forward(SessionMessage::Other {
                    frame_type,
                    raw: frame,
                });
            }
        }
    }

    fn on_control_request(
        self: &Arc<Self>,
        request_id: String,
        subtype: &str,
        request: &Value,
        frame: Value,
    ) {
        let route = CallbackRoute::Control {
            request_id: request_id.clone(),
        };
        match subtype {
            "can_use_tool" => {
                let permission = PermissionRequest::new(self.clone(), route, request);
                self.emit_callback(CallbackRequest::Permission(permission));
            }
            "hook_callback" => {
                let hook = HookRequest::new(self.clone(), route, request);
                self.emit_callback(CallbackRequest::Hook(hook));
            }
            other => {
                warn!(
                    session_id = self.log_id(),
                    request_id = %request_id,
                    subtype = other,
                    "unsupported control request from agent"
                );
                self.forward_opaque(frame);
                let reply = control_error(
                    &request_id,
                    &format!("unsupported control request subtype: {other}"),
                );
                if let Err(err) = self.send(reply) {
                    debug!(session_id = self.log_id(), %err, "could not reject control request");
                }
            }
        }
    }

    fn resolve(&self, request_id: &str, outcome: ControlOutcome) {
        let outcome = outcome.map_err(AppError::Control);
        if !self.pending.complete(request_id, outcome) {
            debug!(session_id = self.log_id(), request_id, "response for unknown request dropped");
            self.diagnostics.record(Diagnostic::new(
                self.session_id().map(str::to_owned),
                DiagnosticKind::CorrelationMiss {
                    request_id: request_id.to_owned(),
                },
            ));
        }
    }

    fn complete_init(&self, frame: &Value) {
        match SessionInit::from_frame(frame) {
            Ok(init) => {
                self.bind_session_id(&init.session_id);
                if let Some(tx) = lock(&self.init_tx).take() {
                    info!(
                        session_id = %init.session_id,
                        model = ?init.model,
                        "session initialised"
                    );
                    let _ = tx.send(init);
                }
            }
            Err(err) => warn!(session_id = self.log_id(), %err, "ignoring system/init"),
        }
    }

    fn forward(&self, message: SessionMessage) {
        if let Some(tx) = lock(&self.messages).as_ref() {
            let _ = tx.send(message);
        }
    }

    fn forward_opaque(&self, frame: Value) {
        let frame_type = frame
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.forward(SessionMessage::Other {
            frame_type,
            raw: frame,
        });
    }

    fn emit_callback(&self, request: CallbackRequest) {
        let undelivered = match lock(&self.callbacks).as_ref() {
            Some(tx) => tx.send(request).err().map(|e| e.0),
            None => Some(request),
        };

        // Nobody will ever answer; refuse rather than leave the agent blocked.
        if let Some(request) = undelivered {
            warn!(session_id = self.log_id(), id = request.id(), "no callback consumer, refusing");
            let result = match &request {
                CallbackRequest::Permission(req) => {
                    req.deny(Some("no permission handler attached"))
                }
                CallbackRequest::Hook(req) => req.respond(Value::Object(Map::new())),
            };
            if let Err(err) = result {
                debug!(session_id = self.log_id(), %err, "could not refuse callback");
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Tear the session down once: fail pending work, close both streams and
    /// abandon outstanding callbacks. Returns `false` if already torn down.
    pub(crate) fn shutdown(&self, reason: &str) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.closed.cancel();
        let failed = self.pending.fail_all(reason);
        lock(&self.messages).take();
        lock(&self.callbacks).take();
        lock(&self.init_tx).take();
        info!(session_id = self.log_id(), reason, failed, "session closed");
        true
    }

    /// Explicit kill. Idempotent.
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown("session killed");
        self.link.close(self.session_id());
    }

    pub(crate) fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// The agent side went away on its own.
    ///
    /// After the handshake this is reported as [`AppError::UnexpectedExit`]
    /// on the backend error stream; before it, the handshake fails.
    pub(crate) fn transport_closed(&self, code: Option<i32>, stderr: String) {
        if self.was_killed() || !self.is_alive() {
            self.shutdown("session killed");
            return;
        }

        let _ = self.exit.set(ExitInfo {
            code,
            stderr: stderr.clone(),
        });

        if self.handshake.is_ready() {
            let err = AppError::UnexpectedExit {
                session_id: self.session_id().map(str::to_owned),
                exit_code: code,
                stderr,
            };
            warn!(session_id = self.log_id(), exit_code = ?code, "agent exited unexpectedly");
            if let Some(errors) = &self.errors {
                let _ = errors.send(err);
            }
        }
        self.shutdown("agent exited");
    }

    /// Map a handshake failure to the error reported to the creator.
    pub(crate) fn startup_error(&self, err: AppError) -> AppError {
        match self.exit.get() {
            Some(exit) => AppError::Spawn {
                reason: match exit.code {
                    Some(code) => format!("agent exited with code {code} before it was ready"),
                    None => "agent exited before it was ready".to_owned(),
                },
                stderr: exit.stderr.clone(),
            },
            None => err,
        }
    }
}
