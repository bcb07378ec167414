#![forbid(unsafe_code)]

//! `agent-conduit`: session protocol engine for stdio agent processes.
//!
//! Frames are newline-delimited JSON objects exchanged with an agent
//! subprocess. A [`Backend`] creates [`Session`]s, either one process per
//! session or many sessions over one multiplexed broker.

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod protocol;
pub mod session;
pub mod transport;

pub use backend::Backend;
pub use config::EngineConfig;
pub use errors::{AppError, Result};
pub use protocol::content::UserContent;
pub use session::{CallbackRequest, Session, SessionMessage, SessionOptions};
