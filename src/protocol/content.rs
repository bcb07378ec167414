//! User-message content.

use serde_json::{json, Value};

/// Content of one outbound user message.
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    /// Plain text.
    Text(String),
    /// Structured content blocks (`text`, `image`, `document`, …).
    Blocks(Vec<Value>),
}

impl UserContent {
    /// Wire form of `message.content`.
    ///
    /// The agent rejects a message with no non-empty text, so empty text is
    /// sent as a single space and block lists without a non-empty `text` block
    /// get a `{"type":"text","text":" "}` placeholder prepended.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Text(text) if text.is_empty() => Value::String(" ".to_owned()),
            Self::Text(text) => Value::String(text.clone()),
            Self::Blocks(blocks) => Value::Array(with_text_placeholder(blocks)),
        }
    }
}

impl From<&str> for UserContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for UserContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Value>> for UserContent {
    fn from(blocks: Vec<Value>) -> Self {
        Self::Blocks(blocks)
    }
}

fn has_text(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("text")
        && block
            .get("text")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty())
}

/// Copy of `blocks` guaranteed to contain one non-empty text block.
#[must_use]
pub fn with_text_placeholder(blocks: &[Value]) -> Vec<Value> {
    if blocks.iter().any(has_text) {
        return blocks.to_vec();
    }
    let mut out = Vec::with_capacity(blocks.len() + 1);
    out.push(json!({"type": "text", "text": " "}));
    out.extend(blocks.iter().cloned());
    out
}
