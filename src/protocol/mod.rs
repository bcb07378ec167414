//! Wire vocabulary of the agent protocol.
//!
//! - [`frame`]: classification of inbound frames and builders for outbound ones.
//! - [`content`]: user-message content and the text-placeholder rule.

pub mod content;
pub mod frame;

/// Generate a fresh opaque request identifier.
#[must_use]
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}
