//! Bounded stderr capture for agent processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::diagnostics::{Diagnostic, DiagnosticKind, SharedDiagnostics};
use crate::transport::codec::{Line, LineCodec};

/// Append-only ring of the most recent stderr lines.
///
/// Cloning shares the same buffer.
#[derive(Debug, Clone)]
pub struct StderrRing {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrRing {
    /// Create an empty ring holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity,
        }
    }

    /// Append one line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    /// Snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.iter().cloned().collect()
    }

    /// Retained lines joined with `\n`.
    #[must_use]
    pub fn tail(&self) -> String {
        self.lines().join("\n")
    }

    /// Maximum number of retained lines.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Longest stderr line kept whole; longer lines leave a marker in the ring.
pub const MAX_STDERR_LINE_BYTES: usize = 64 * 1024;

/// Drain `stderr` line by line into `ring` and `diagnostics`.
///
/// Lines are decoded lossily, so invalid UTF-8 never stops the capture.
/// Returns at EOF or on a read error.
pub async fn run_capture<R>(
    label: String,
    stderr: R,
    ring: StderrRing,
    diagnostics: SharedDiagnostics,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, LineCodec::with_max_length(MAX_STDERR_LINE_BYTES));
    while let Some(item) = framed.next().await {
        let line = match item {
            Ok(Line::Complete(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Line::Oversized(len)) => format!("[stderr line of {len} bytes discarded]"),
            Err(err) => {
                debug!(agent = %label, %err, "agent stderr read failed, stopping capture");
                return;
            }
        };
        debug!(agent = %label, line = %line, "agent stderr");
        diagnostics.record(Diagnostic::new(
            None,
            DiagnosticKind::Stderr { line: line.clone() },
        ));
        ring.push(line);
    }
}
