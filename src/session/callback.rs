//! Permission and hook callbacks.
//!
//! Every callback frame from the agent becomes one [`CallbackRequest`] on the
//! session's callback stream. Exactly one answer may be given per request:
//! - the first answer emits exactly one response frame;
//! - any later answer, including through a clone, fails with
//!   [`AppError::AlreadyResponded`] and emits nothing;
//! - answering after the session was torn down emits nothing and returns
//!   `Ok(())`, since the agent is no longer waiting.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::protocol::frame::{permission_allow, permission_deny};
use crate::session::dispatcher::SessionCore;
use crate::{AppError, Result};

/// Reason sent when a permission is denied without one.
pub const DEFAULT_DENY_MESSAGE: &str = "Permission denied by user";

/// How an answer travels back to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallbackRoute {
    /// `control_response` echoing an agent `control_request` id.
    Control {
        /// The agent's request id.
        request_id: String,
    },
    /// `callback.response` echoing a broker callback id.
    Broker {
        /// The broker's callback id.
        callback_id: String,
    },
}

impl CallbackRoute {
    fn id(&self) -> &str {
        match self {
            Self::Control { request_id } => request_id,
            Self::Broker { callback_id } => callback_id,
        }
    }
}

/// Single-answer guard shared by every clone of one request.
struct Responder {
    core: Arc<SessionCore>,
    route: CallbackRoute,
    answered: AtomicBool,
}

impl Responder {
    fn new(core: Arc<SessionCore>, route: CallbackRoute) -> Arc<Self> {
        Arc::new(Self {
            core,
            route,
            answered: AtomicBool::new(false),
        })
    }

    fn respond(&self, response: Value) -> Result<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyResponded(self.route.id().to_owned()));
        }
        if !self.core.is_alive() {
            debug!(callback_id = self.route.id(), "session closed, callback abandoned");
            return Ok(());
        }
        self.core.answer_callback(&self.route, response)
    }

    fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }
}

/// A tool-permission question from the agent.
#[derive(Clone)]
pub struct PermissionRequest {
    tool_name: String,
    input: Value,
    tool_use_id: Option<String>,
    blocked_path: Option<String>,
    suggestions: Option<Value>,
    responder: Arc<Responder>,
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest")
            .field("id", &self.responder.route.id())
            .field("tool_name", &self.tool_name)
            .field("tool_use_id", &self.tool_use_id)
            .field("answered", &self.responder.is_answered())
            .finish_non_exhaustive()
    }
}

impl PermissionRequest {
    pub(crate) fn new(core: Arc<SessionCore>, route: CallbackRoute, body: &Value) -> Self {
        let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            tool_name: text("tool_name").unwrap_or_default(),
            input: body.get("input").cloned().unwrap_or_else(|| json!({})),
            tool_use_id: text("tool_use_id"),
            blocked_path: text("blocked_path"),
            suggestions: body.get("permission_suggestions").cloned(),
            responder: Responder::new(core, route),
        }
    }

    /// Correlation id of this request.
    #[must_use]
    pub fn id(&self) -> &str {
        self.responder.route.id()
    }

    /// Tool the agent wants to use.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Tool input as proposed by the agent.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Originating tool-use id.
    #[must_use]
    pub fn tool_use_id(&self) -> Option<&str> {
        self.tool_use_id.as_deref()
    }

    /// Path outside the allowed directories that triggered the question.
    #[must_use]
    pub fn blocked_path(&self) -> Option<&str> {
        self.blocked_path.as_deref()
    }

    /// Permission rules the agent suggests adding.
    #[must_use]
    pub fn suggestions(&self) -> Option<&Value> {
        self.suggestions.as_ref()
    }

    /// Whether an answer has already been given.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.responder.is_answered()
    }

    /// Allow the tool call, optionally with modified input.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyResponded` on a second answer.
    /// - Transport errors if the response cannot be written.
    pub fn allow(&self, updated_input: Option<Value>) -> Result<()> {
        self.allow_inner(updated_input, None)
    }

    /// Allow the tool call and add permission rules.
    ///
    /// # Errors
    ///
    /// As [`allow`](Self::allow).
    pub fn allow_with_permissions(
        &self,
        updated_input: Option<Value>,
        updated_permissions: Value,
    ) -> Result<()> {
        self.allow_inner(updated_input, Some(updated_permissions))
    }

    fn allow_inner(&self, updated_input: Option<Value>, permissions: Option<Value>) -> Result<()> {
        info!(tool = %self.tool_name, id = self.id(), "permission allowed");
        let input = updated_input.unwrap_or_else(|| self.input.clone());
        self.responder
            .respond(permission_allow(input, self.tool_use_id(), permissions))
    }

    /// Deny the tool call with `message`, or a generic reason.
    ///
    /// # Errors
    ///
    /// As [`allow`](Self::allow).
    pub fn deny(&self, message: Option<&str>) -> Result<()> {
        self.deny_inner(message, false)
    }

    /// Deny the tool call and ask the agent to stop the turn.
    ///
    /// # Errors
    ///
    /// As [`allow`](Self::allow).
    pub fn deny_and_interrupt(&self, message: Option<&str>) -> Result<()> {
        self.deny_inner(message, true)
    }

    fn deny_inner(&self, message: Option<&str>, interrupt: bool) -> Result<()> {
        let message = message.unwrap_or(DEFAULT_DENY_MESSAGE);
        info!(tool = %self.tool_name, id = self.id(), interrupt, "permission denied");
        self.responder
            .respond(permission_deny(message, self.tool_use_id(), interrupt))
    }
}

/// A hook invocation from the agent.
#[derive(Clone)]
pub struct HookRequest {
    hook_callback_id: Option<String>,
    hook_event: Option<String>,
    input: Value,
    tool_use_id: Option<String>,
    responder: Arc<Responder>,
}

impl fmt::Debug for HookRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRequest")
            .field("id", &self.responder.route.id())
            .field("hook_callback_id", &self.hook_callback_id)
            .field("hook_event", &self.hook_event)
            .field("answered", &self.responder.is_answered())
            .finish_non_exhaustive()
    }
}

impl HookRequest {
    pub(crate) fn new(core: Arc<SessionCore>, route: CallbackRoute, body: &Value) -> Self {
        let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_owned);
        let input = body.get("input").cloned().unwrap_or_else(|| json!({}));
        let hook_event = input
            .get("hook_event_name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| text("hook_event_name"));
        Self {
            hook_callback_id: text("callback_id"),
            hook_event,
            input,
            tool_use_id: text("tool_use_id"),
            responder: Responder::new(core, route),
        }
    }

    /// Correlation id of this request.
    #[must_use]
    pub fn id(&self) -> &str {
        self.responder.route.id()
    }

    /// Registered hook callback id, as given in the `initialize` hooks.
    #[must_use]
    pub fn hook_callback_id(&self) -> Option<&str> {
        self.hook_callback_id.as_deref()
    }

    /// Hook event name (`PreToolUse`, `Stop`, …), when sent.
    #[must_use]
    pub fn hook_event(&self) -> Option<&str> {
        self.hook_event.as_deref()
    }

    /// Hook input.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Originating tool-use id.
    #[must_use]
    pub fn tool_use_id(&self) -> Option<&str> {
        self.tool_use_id.as_deref()
    }

    /// Whether an answer has already been given.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.responder.is_answered()
    }

    /// Answer with an arbitrary hook output object.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyResponded` on a second answer.
    /// - Transport errors if the response cannot be written.
    pub fn respond(&self, output: Value) -> Result<()> {
        debug!(id = self.id(), "hook answered");
        self.responder.respond(output)
    }

    /// Let the hooked action proceed.
    ///
    /// # Errors
    ///
    /// As [`respond`](Self::respond).
    pub fn approve(&self) -> Result<()> {
        self.respond(json!({"decision": "approve"}))
    }

    /// Block the hooked action with `reason`.
    ///
    /// # Errors
    ///
    /// As [`respond`](Self::respond).
    pub fn block(&self, reason: &str) -> Result<()> {
        self.respond(json!({"decision": "block", "reason": reason}))
    }
}

/// One callback awaiting an answer.
#[derive(Debug, Clone)]
pub enum CallbackRequest {
    /// `can_use_tool`.
    Permission(PermissionRequest),
    /// Hook invocation.
    Hook(HookRequest),
}

impl CallbackRequest {
    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Permission(req) => req.id(),
            Self::Hook(req) => req.id(),
        }
    }

    /// Whether an answer has already been given.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        match self {
            Self::Permission(req) => req.is_answered(),
            Self::Hook(req) => req.is_answered(),
        }
    }
}
