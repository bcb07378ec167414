//! Frame classification and outbound frame builders.
//!
//! Inbound frames are classified once, by their `type` tag, into
//! [`InboundFrame`]. Classification is total: a recognised tag with missing
//! fields becomes [`InboundFrame::Malformed`] and an unrecognised tag becomes
//! [`InboundFrame::Unknown`], both keeping the raw frame so it can still be
//! forwarded.

use serde_json::{json, Map, Value};

use crate::protocol::content::UserContent;

/// Outcome carried by a correlated response: success payload or error text.
pub type ControlOutcome = std::result::Result<Value, String>;

/// Which callback a `callback.request` frame asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Tool permission decision.
    CanUseTool,
    /// Hook invocation.
    Hook,
}

/// One inbound frame, classified by its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `system`; subtype `init` completes the handshake.
    System {
        /// `subtype` field, when present.
        subtype: Option<String>,
        /// Raw frame.
        frame: Value,
    },
    /// `assistant` turn content.
    Assistant(Value),
    /// `user` echo or tool result.
    User(Value),
    /// `result`: end of one turn.
    Result(Value),
    /// `stream_event`: incremental delta, never terminal.
    StreamEvent(Value),
    /// `control_request` initiated by the agent.
    ControlRequest {
        /// Id to echo in the answer.
        request_id: String,
        /// `request.subtype`.
        subtype: String,
        /// The `request` object.
        request: Value,
        /// Raw frame.
        frame: Value,
    },
    /// `control_response` to a request we sent.
    ControlResponse {
        /// Id of the request being answered.
        request_id: String,
        /// Success payload or error text.
        outcome: ControlOutcome,
    },
    /// `session.created` (multiplexed).
    SessionCreated {
        /// Id of the `session.create` request.
        request_id: String,
        /// Assigned session id.
        session_id: String,
    },
    /// `session.error` (multiplexed).
    SessionError {
        /// Id of the `session.create` request.
        request_id: String,
        /// Error text.
        error: String,
    },
    /// `session.message` (multiplexed): one per-session frame.
    SessionMessage {
        /// Target session.
        session_id: String,
        /// Wrapped frame.
        message: Value,
    },
    /// `session.closed` (multiplexed).
    SessionClosed {
        /// Closed session.
        session_id: String,
        /// Optional reason text.
        reason: Option<String>,
    },
    /// `callback.request` (multiplexed).
    CallbackRequest {
        /// Target session.
        session_id: String,
        /// Id to echo in `callback.response`.
        callback_id: String,
        /// Permission or hook.
        kind: CallbackKind,
        /// Raw frame.
        frame: Value,
    },
    /// `query.result` or inbound `callback.response` (multiplexed).
    QueryResult {
        /// Id of the request being answered.
        request_id: String,
        /// Session the request belongs to.
        session_id: Option<String>,
        /// Success payload or error text.
        outcome: ControlOutcome,
    },
    /// Recognised tag with a missing or mistyped required field.
    Malformed {
        /// What was missing.
        reason: String,
        /// Raw frame.
        frame: Value,
    },
    /// Unrecognised or absent tag.
    Unknown {
        /// The `type` tag, if any.
        frame_type: Option<String>,
        /// Raw frame.
        frame: Value,
    },
}

fn str_field(frame: &Value, key: &str) -> Option<String> {
    frame.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn error_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown error".to_owned(),
        Some(other) => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_owned),
    }
}

fn malformed(reason: &str, frame: Value) -> InboundFrame {
    InboundFrame::Malformed {
        reason: reason.to_owned(),
        frame,
    }
}

impl InboundFrame {
    /// Classify one decoded frame.
    #[must_use]
    pub fn classify(frame: Value) -> Self {
        let Some(frame_type) = frame.get("type").and_then(Value::as_str) else {
            return Self::Unknown {
                frame_type: None,
                frame,
            };
        };

        match frame_type {
            "system" => Self::System {
                subtype: str_field(&frame, "subtype"),
                frame,
            },
            "assistant" => Self::Assistant(frame),
            "user" => Self::User(frame),
            "result" => Self::Result(frame),
            "stream_event" => Self::StreamEvent(frame),
            "control_request" => classify_control_request(frame),
            "control_response" => classify_control_response(frame),
            "session.created" => {
                match (str_field(&frame, "request_id"), str_field(&frame, "session_id")) {
                    (Some(request_id), Some(session_id)) => Self::SessionCreated {
                        request_id,
                        session_id,
                    },
                    _ => malformed("session.created without request_id/session_id", frame),
                }
            }
            "session.error" => match str_field(&frame, "request_id") {
                Some(request_id) => Self::SessionError {
                    request_id,
                    error: error_text(frame.get("error")),
                },
                None => malformed("session.error without request_id", frame),
            },
            "session.message" => match (str_field(&frame, "session_id"), frame.get("message")) {
                (Some(session_id), Some(message)) if message.is_object() => {
                    Self::SessionMessage {
                        session_id,
                        message: message.clone(),
                    }
                }
                _ => malformed("session.message without session_id/message", frame),
            },
            "session.closed" => match str_field(&frame, "session_id") {
                Some(session_id) => Self::SessionClosed {
                    session_id,
                    reason: str_field(&frame, "reason"),
                },
                None => malformed("session.closed without session_id", frame),
            },
            "callback.request" => classify_callback_request(frame),
            "query.result" | "callback.response" => match str_field(&frame, "request_id") {
                Some(request_id) => {
                    let success = frame
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let outcome = if success {
                        Ok(frame.get("result").cloned().unwrap_or(Value::Null))
                    } else {
                        Err(error_text(frame.get("error")))
                    };
                    Self::QueryResult {
                        request_id,
                        session_id: str_field(&frame, "session_id"),
                        outcome,
                    }
                }
                None => malformed("query result without request_id", frame),
            },
            other => Self::Unknown {
                frame_type: Some(other.to_owned()),
                frame,
            },
        }
    }

    /// The `type` tag of this frame.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::System { .. } => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::StreamEvent(_) => "stream_event",
            Self::ControlRequest { .. } => "control_request",
            Self::ControlResponse { .. } => "control_response",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionError { .. } => "session.error",
            Self::SessionMessage { .. } => "session.message",
            Self::SessionClosed { .. } => "session.closed",
            Self::CallbackRequest { .. } => "callback.request",
            Self::QueryResult { .. } => "query.result",
            Self::Malformed { .. } => "malformed",
            Self::Unknown { frame_type, .. } => frame_type.as_deref().unwrap_or("unknown"),
        }
    }
}

fn classify_control_request(frame: Value) -> InboundFrame {
    let request_id = str_field(&frame, "request_id");
    let request = frame.get("request").filter(|r| r.is_object()).cloned();
    let subtype = request
        .as_ref()
        .and_then(|r| r.get("subtype"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    match (request_id, request, subtype) {
        (Some(request_id), Some(request), Some(subtype)) => InboundFrame::ControlRequest {
            request_id,
            subtype,
            request,
            frame,
        },
        _ => malformed("control_request without request_id/request.subtype", frame),
    }
}

fn classify_control_response(frame: Value) -> InboundFrame {
    let Some(response) = frame.get("response").filter(|r| r.is_object()) else {
        return malformed("control_response without response", frame);
    };

    let request_id =
        str_field(response, "request_id").or_else(|| str_field(&frame, "request_id"));
    let Some(request_id) = request_id else {
        return malformed("control_response without request_id", frame);
    };

    let outcome = match response.get("subtype").and_then(Value::as_str) {
        Some("error") => Err(error_text(response.get("error"))),
        _ => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
    };

    InboundFrame::ControlResponse {
        request_id,
        outcome,
    }
}

fn classify_callback_request(frame: Value) -> InboundFrame {
    let kind = match frame.get("kind").and_then(Value::as_str) {
        Some("can_use_tool") => CallbackKind::CanUseTool,
        Some("hook" | "hook_callback") => CallbackKind::Hook,
        _ => return malformed("callback.request with unknown kind", frame),
    };

    match (str_field(&frame, "session_id"), str_field(&frame, "callback_id")) {
        (Some(session_id), Some(callback_id)) => InboundFrame::CallbackRequest {
            session_id,
            callback_id,
            kind,
            frame,
        },
        _ => malformed("callback.request without session_id/callback_id", frame),
    }
}

// ── Outbound builders ────────────────────────────────────────────────────────

/// `control_request` with `subtype` and any extra request fields.
#[must_use]
pub fn control_request(request_id: &str, subtype: &str, fields: Map<String, Value>) -> Value {
    let mut request = Map::with_capacity(fields.len() + 1);
    request.insert("subtype".to_owned(), Value::String(subtype.to_owned()));
    request.extend(fields);
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": Value::Object(request),
    })
}

/// `control_response` success answering an agent-initiated request.
#[must_use]
pub fn control_success(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

/// `control_response` error answering an agent-initiated request.
#[must_use]
pub fn control_error(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        },
    })
}

/// `user` message frame.
#[must_use]
pub fn user_message(content: &UserContent, session_id: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "user",
        "message": { "role": "user", "content": content.to_wire() },
        "parent_tool_use_id": null,
    });
    if let (Some(id), Some(obj)) = (session_id, frame.as_object_mut()) {
        obj.insert("session_id".to_owned(), Value::String(id.to_owned()));
    }
    frame
}

/// Permission answer body: allow.
#[must_use]
pub fn permission_allow(
    updated_input: Value,
    tool_use_id: Option<&str>,
    updated_permissions: Option<Value>,
) -> Value {
    let mut body = json!({
        "behavior": "allow",
        "updatedInput": updated_input,
        "toolUseID": tool_use_id,
    });
    if let (Some(perms), Some(obj)) = (updated_permissions, body.as_object_mut()) {
        obj.insert("updatedPermissions".to_owned(), perms);
    }
    body
}

/// Permission answer body: deny.
#[must_use]
pub fn permission_deny(message: &str, tool_use_id: Option<&str>, interrupt: bool) -> Value {
    let mut body = json!({
        "behavior": "deny",
        "message": message,
        "toolUseID": tool_use_id,
    });
    if let (true, Some(obj)) = (interrupt, body.as_object_mut()) {
        obj.insert("interrupt".to_owned(), Value::Bool(true));
    }
    body
}

/// `session.create` (multiplexed).
#[must_use]
pub fn session_create(request_id: &str, options: Value, message: Value) -> Value {
    json!({
        "type": "session.create",
        "request_id": request_id,
        "options": options,
        "message": message,
    })
}

/// `session.message` envelope carrying one per-session frame (multiplexed).
#[must_use]
pub fn session_message(session_id: &str, message: Value) -> Value {
    json!({
        "type": "session.message",
        "session_id": session_id,
        "message": message,
    })
}

/// `session.close` (multiplexed).
#[must_use]
pub fn session_close(session_id: &str) -> Value {
    json!({ "type": "session.close", "session_id": session_id })
}

/// `callback.response` answering a `callback.request` (multiplexed).
#[must_use]
pub fn callback_response(session_id: &str, callback_id: &str, response: Value) -> Value {
    json!({
        "type": "callback.response",
        "session_id": session_id,
        "callback_id": callback_id,
        "response": response,
    })
}
