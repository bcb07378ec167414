//! Messages delivered on a session's outward stream.

use serde_json::Value;

/// One frame delivered to the session consumer, in pipe order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMessage {
    /// `system` frame (`init`, `compact_boundary`, `status`, …).
    System {
        /// `subtype`, when present.
        subtype: Option<String>,
        /// Raw frame.
        raw: Value,
    },
    /// `assistant` frame.
    Assistant(Value),
    /// `user` frame.
    User(Value),
    /// `result` frame: the end of one turn.
    Result(TurnResult),
    /// `stream_event` delta; never terminal.
    StreamEvent(Value),
    /// Any frame without a dedicated variant, forwarded unchanged.
    Other {
        /// The `type` tag, if any.
        frame_type: Option<String>,
        /// Raw frame.
        raw: Value,
    },
}

impl SessionMessage {
    /// Whether this message ends a conversational turn.
    #[must_use]
    pub fn is_turn_complete(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// The wire frame behind this message.
    #[must_use]
    pub fn raw(&self) -> &Value {
        match self {
            Self::System { raw, .. } | Self::Other { raw, .. } => raw,
            Self::Assistant(raw) | Self::User(raw) | Self::StreamEvent(raw) => raw,
            Self::Result(result) => &result.raw,
        }
    }
}

/// Summary of a `result` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// `subtype` (`success`, `error_max_turns`, …).
    pub subtype: Option<String>,
    /// Whether the turn ended in error.
    pub is_error: bool,
    /// Cumulative number of turns.
    pub num_turns: Option<u64>,
    /// Cumulative cost in USD.
    pub total_cost_usd: Option<f64>,
    /// Cumulative token usage, as sent.
    pub usage: Option<Value>,
    /// Final result text, when present.
    pub result: Option<String>,
    /// Session the result belongs to.
    pub session_id: Option<String>,
    /// Raw frame.
    pub raw: Value,
}

impl TurnResult {
    /// Summarise a `result` frame. Missing fields become `None`.
    #[must_use]
    pub fn from_frame(raw: Value) -> Self {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            subtype: text("subtype"),
            is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            num_turns: raw.get("num_turns").and_then(Value::as_u64),
            total_cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
            usage: raw.get("usage").cloned(),
            result: text("result"),
            session_id: text("session_id"),
            raw,
        }
    }
}
