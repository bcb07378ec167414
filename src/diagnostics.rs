//! Side channel for non-fatal protocol diagnostics.
//!
//! Malformed lines, correlation misses, oversized lines, and agent stderr never
//! escape the dispatcher as errors. They are reported here instead, through a
//! [`DiagnosticSink`] handed explicitly to every transport and session.
//!
//! This is separate from `tracing`: every diagnostic is also logged, but the
//! sink lets an embedding application observe them as data.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// What kind of diagnostic was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A line was not valid JSON and was skipped.
    FrameParse {
        /// The offending line, lossily decoded.
        line: String,
        /// Parser message.
        error: String,
    },
    /// A line exceeded the configured limit and was discarded.
    OversizedLine {
        /// Bytes discarded.
        len: usize,
    },
    /// A correlated frame named an unknown request id.
    CorrelationMiss {
        /// The unknown id.
        request_id: String,
    },
    /// One line of agent stderr.
    Stderr {
        /// The line, without terminator.
        line: String,
    },
}

/// A timestamped diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// When the diagnostic was recorded.
    pub at: DateTime<Utc>,
    /// Session the diagnostic belongs to, when known.
    pub session_id: Option<String>,
    /// Diagnostic payload.
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    /// Create a diagnostic stamped with the current UTC time.
    #[must_use]
    pub fn new(session_id: Option<String>, kind: DiagnosticKind) -> Self {
        Self {
            at: Utc::now(),
            session_id,
            kind,
        }
    }
}

/// Receiver of diagnostic records.
///
/// `record` is synchronous and infallible so it can be called from the
/// dispatch path without affecting frame ordering.
pub trait DiagnosticSink: Send + Sync {
    /// Record one diagnostic.
    fn record(&self, diagnostic: Diagnostic);
}

/// No-op sink used when the caller does not ask for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiagnostics;

impl DiagnosticSink for NoDiagnostics {
    fn record(&self, _diagnostic: Diagnostic) {}
}

/// Sink that forwards every record to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDiagnostics {
    tx: mpsc::UnboundedSender<Diagnostic>,
}

impl ChannelDiagnostics {
    /// Create a sink and the receiver that observes it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Diagnostic>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DiagnosticSink for ChannelDiagnostics {
    fn record(&self, diagnostic: Diagnostic) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(diagnostic);
    }
}

/// Shared handle type threaded through the engine.
pub type SharedDiagnostics = Arc<dyn DiagnosticSink>;

/// The default no-op handle.
#[must_use]
pub fn no_diagnostics() -> SharedDiagnostics {
    Arc::new(NoDiagnostics)
}
