//! Initialization handshake.
//!
//! A session is ready only after two independent conditions have both been
//! observed, in either order:
//! 1. the acknowledgment correlated to the `initialize` (or `session.create`)
//!    request;
//! 2. a `system` frame with subtype `init` carrying the session id.
//!
//! [`await_ready`] waits for both under one deadline. Reaching the deadline
//! yields [`AppError::HandshakeTimeout`] naming whichever conditions are still
//! missing; the caller kills the agent.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::lock;
use crate::{AppError, Result};

/// Name of the acknowledgment condition in timeout errors.
pub const ACK_CONDITION: &str = "control acknowledgment";
/// Name of the `system/init` condition in timeout errors.
pub const INIT_CONDITION: &str = "system/init";

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Agent started, nothing sent yet.
    Spawned,
    /// `initialize` sent.
    InitSent,
    /// Initial user message sent; waiting on the two conditions.
    AwaitingReady {
        /// Acknowledgment observed.
        ack: bool,
        /// `system/init` observed.
        init: bool,
    },
    /// Both conditions observed.
    Ready,
    /// Timed out or the agent went away first.
    Failed,
}

/// Shared, observable handshake state.
#[derive(Debug)]
pub struct HandshakeTracker {
    state: Mutex<HandshakeState>,
}

impl Default for HandshakeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeTracker {
    /// Start in [`HandshakeState::Spawned`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::Spawned),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        *lock(&self.state)
    }

    /// Whether the handshake completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == HandshakeState::Ready
    }

    /// `initialize` has been written.
    pub fn init_sent(&self) {
        self.transition(|s| match s {
            HandshakeState::Spawned => HandshakeState::InitSent,
            other => other,
        });
    }

    /// The initial user message has been written.
    pub fn awaiting(&self) {
        self.transition(|s| match s {
            HandshakeState::Spawned | HandshakeState::InitSent => HandshakeState::AwaitingReady {
                ack: false,
                init: false,
            },
            other => other,
        });
    }

    fn observe(&self, ack_seen: bool, init_seen: bool) {
        self.transition(|s| match s {
            HandshakeState::Spawned | HandshakeState::InitSent => {
                HandshakeState::AwaitingReady {
                    ack: ack_seen,
                    init: init_seen,
                }
            }
            HandshakeState::AwaitingReady { ack, init } => HandshakeState::AwaitingReady {
                ack: ack || ack_seen,
                init: init || init_seen,
            },
            other => other,
        });
    }

    fn ready(&self) {
        self.transition(|s| match s {
            HandshakeState::Failed => HandshakeState::Failed,
            _ => HandshakeState::Ready,
        });
    }

    /// Enter [`HandshakeState::Failed`] unless already ready.
    pub fn fail(&self) {
        self.transition(|s| match s {
            HandshakeState::Ready => HandshakeState::Ready,
            _ => HandshakeState::Failed,
        });
    }

    fn transition(&self, f: impl FnOnce(HandshakeState) -> HandshakeState) {
        let mut state = lock(&self.state);
        let next = f(*state);
        if next != *state {
            debug!(from = ?*state, to = ?next, "handshake transition");
            *state = next;
        }
    }
}

/// Capability snapshot taken from the `system/init` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInit {
    /// Agent-assigned session id.
    pub session_id: String,
    /// Active model.
    pub model: Option<String>,
    /// Active permission mode.
    pub permission_mode: Option<String>,
    /// Available tools.
    pub tools: Vec<String>,
    /// Agent working directory.
    pub cwd: Option<String>,
    /// Available slash commands.
    pub slash_commands: Vec<String>,
    /// Payload of the initialize acknowledgment.
    pub capabilities: Value,
    /// The raw `system/init` frame.
    pub raw: Value,
}

fn string_list(frame: &Value, key: &str) -> Vec<String> {
    frame
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("name").and_then(Value::as_str).map(str::to_owned),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl SessionInit {
    /// Parse a `system/init` frame.
    ///
    /// # Errors
    ///
    /// `AppError::Protocol` if `session_id` is missing.
    pub fn from_frame(frame: &Value) -> Result<Self> {
        let session_id = frame
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Protocol("system/init without session_id".into()))?
            .to_owned();
        let text = |key: &str| frame.get(key).and_then(Value::as_str).map(str::to_owned);

        Ok(Self {
            session_id,
            model: text("model"),
            permission_mode: text("permissionMode").or_else(|| text("permission_mode")),
            tools: string_list(frame, "tools"),
            cwd: text("cwd"),
            slash_commands: string_list(frame, "slash_commands"),
            capabilities: Value::Null,
            raw: frame.clone(),
        })
    }
}

/// Wait until both `ack` and `init` complete, `closed` fires, or `timeout`
/// elapses, recording progress on `tracker`.
///
/// # Errors
///
/// - `AppError::HandshakeTimeout` naming the missing conditions.
/// - `AppError::Disposed` if `closed` fires or `init` is dropped first.
/// - Whatever error `ack` resolves with.
pub async fn await_ready<A>(
    tracker: &HandshakeTracker,
    ack: A,
    mut init: oneshot::Receiver<SessionInit>,
    closed: &CancellationToken,
    timeout: Duration,
) -> Result<(Value, SessionInit)>
where
    A: Future<Output = Result<Value>>,
{
    tokio::pin!(ack);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut ack_value: Option<Value> = None;
    let mut init_value: Option<SessionInit> = None;

    loop {
        if ack_value.is_some() && init_value.is_some() {
            break;
        }

        tokio::select! {
            result = &mut ack, if ack_value.is_none() => match result {
                Ok(value) => {
                    debug!("handshake: acknowledgment received");
                    tracker.observe(true, false);
                    ack_value = Some(value);
                }
                Err(err) => {
                    tracker.fail();
                    return Err(err);
                }
            },

            result = &mut init, if init_value.is_none() => match result {
                Ok(snapshot) => {
                    debug!(session_id = %snapshot.session_id, "handshake: system/init received");
                    tracker.observe(false, true);
                    init_value = Some(snapshot);
                }
                Err(_) => {
                    tracker.fail();
                    return Err(AppError::Disposed("session closed during handshake".into()));
                }
            },

            () = closed.cancelled() => {
                tracker.fail();
                return Err(AppError::Disposed("session closed during handshake".into()));
            }

            () = &mut deadline => {
                let mut missing = Vec::with_capacity(2);
                if ack_value.is_none() {
                    missing.push(ACK_CONDITION);
                }
                if init_value.is_none() {
                    missing.push(INIT_CONDITION);
                }
                warn!(?timeout, ?missing, "handshake timed out");
                tracker.fail();
                return Err(AppError::HandshakeTimeout { timeout, missing });
            }
        }
    }

    match (ack_value, init_value) {
        (Some(ack), Some(mut snapshot)) => {
            tracker.ready();
            snapshot.capabilities = ack;
            Ok((snapshot.capabilities.clone(), snapshot))
        }
        _ => Err(AppError::Protocol("handshake finished incomplete".into())),
    }
}
