//! Pending-request table.
//!
//! Maps an outbound request id to the one-shot sender of its caller. An entry
//! leaves the table exactly once: when a matching response resolves it, when
//! the caller cleans it up, or when the owning scope is disposed and every
//! remaining entry is failed with [`AppError::Disposed`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::session::lock;
use crate::{AppError, Result};

/// What a pending entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// `initialize` or `session.create`.
    Create,
    /// Administrative call (`interrupt`, `set_model`, …).
    Control,
    /// Method-style query returning a value.
    Query,
}

/// Receiver half handed to the caller of [`PendingTable::register`].
pub type PendingReceiver = oneshot::Receiver<Result<Value>>;

#[derive(Debug)]
struct Entry {
    kind: PendingKind,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    closed: Option<String>,
}

/// Correlation table from request id to outcome slot.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    /// Create an empty, open table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry and return the receiver its outcome will be sent on.
    ///
    /// # Errors
    ///
    /// - `AppError::Disposed` once [`fail_all`](Self::fail_all) has run.
    /// - `AppError::Protocol` if `request_id` is already pending.
    pub fn register(&self, request_id: &str, kind: PendingKind) -> Result<PendingReceiver> {
        let mut inner = lock(&self.inner);
        if let Some(reason) = &inner.closed {
            return Err(AppError::Disposed(reason.clone()));
        }
        if inner.entries.contains_key(request_id) {
            return Err(AppError::Protocol(format!(
                "request id {request_id} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner
            .entries
            .insert(request_id.to_owned(), Entry { kind, tx });
        Ok(rx)
    }

    /// Resolve `request_id` with `outcome`.
    ///
    /// Returns `false` when no such entry exists (a correlation miss).
    pub fn complete(&self, request_id: &str, outcome: Result<Value>) -> bool {
        let entry = lock(&self.inner).entries.remove(request_id);
        match entry {
            Some(entry) => {
                debug!(
                    request_id,
                    kind = ?entry.kind,
                    ok = outcome.is_ok(),
                    "pending request resolved"
                );
                // The caller may have stopped waiting; the entry is resolved either way.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it. Returns its kind if it was present.
    pub fn remove(&self, request_id: &str) -> Option<PendingKind> {
        lock(&self.inner)
            .entries
            .remove(request_id)
            .map(|entry| entry.kind)
    }

    /// Fail every entry with `AppError::Disposed(reason)` and close the table.
    ///
    /// Returns the number of entries failed. Later calls fail nothing.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Entry)> = {
            let mut inner = lock(&self.inner);
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_owned());
            }
            inner.entries.drain().collect()
        };
        let count = drained.len();
        for (request_id, entry) in drained {
            debug!(request_id = %request_id, kind = ?entry.kind, reason, "failing pending request");
            let _ = entry.tx.send(Err(AppError::Disposed(reason.to_owned())));
        }
        count
    }

    /// Kind of a pending entry.
    #[must_use]
    pub fn kind_of(&self, request_id: &str) -> Option<PendingKind> {
        lock(&self.inner).entries.get(request_id).map(|e| e.kind)
    }

    /// Number of unresolved entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Whether no entries are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`fail_all`](Self::fail_all) has closed the table.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed.is_some()
    }
}

/// Await a registered entry.
///
/// A sender dropped without an outcome counts as disposal.
///
/// # Errors
///
/// Whatever error the entry was resolved with.
pub async fn wait(rx: PendingReceiver) -> Result<Value> {
    rx.await
        .unwrap_or_else(|_| Err(AppError::Disposed("request abandoned".into())))
}
