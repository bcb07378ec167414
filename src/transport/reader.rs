//! Transport reader task.
//!
//! Drives a [`FramedRead`] over the agent's stdout using [`LineCodec`], decodes
//! each complete line as JSON, and forwards the resulting frames through an
//! unbounded [`mpsc`] channel in arrival order.
//!
//! Empty lines are dropped. Lines that are not valid JSON, and lines over the
//! length limit, are reported to the [`DiagnosticSink`](crate::diagnostics::DiagnosticSink)
//! and skipped; they never stop the reader.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::diagnostics::{Diagnostic, DiagnosticKind, SharedDiagnostics};
use crate::transport::codec::{Line, LineCodec};
use crate::{AppError, Result};

/// Decode one complete line into a frame.
///
/// # Return value
///
/// - `Ok(Some(frame))`: the line is a JSON value.
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// [`AppError::FrameParse`] if the line is not valid UTF-8 JSON.
pub fn parse_line(line: &[u8]) -> Result<Option<Value>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| AppError::FrameParse(format!("malformed json: {e}")))
}

/// Reader task: reads NDJSON lines from `stdout` and emits decoded frames.
///
/// Returns when the stream reaches EOF, the underlying read fails, `cancel`
/// fires, or `frame_tx` is closed. Dropping `frame_tx` on return is the
/// transport-closed signal observed by the dispatcher.
pub async fn run_reader<R>(
    label: String,
    stdout: R,
    max_line_bytes: usize,
    frame_tx: mpsc::UnboundedSender<Value>,
    diagnostics: SharedDiagnostics,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, LineCodec::with_max_length(max_line_bytes));

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(agent = %label, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(agent = %label, "reader: EOF detected");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(agent = %label, error = %e, "reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(Line::Oversized(len))) => {
                        warn!(agent = %label, len, "reader: oversized line discarded");
                        diagnostics.record(Diagnostic::new(
                            None,
                            DiagnosticKind::OversizedLine { len },
                        ));
                    }

                    Some(Ok(Line::Complete(bytes))) => match parse_line(&bytes) {
                        Ok(Some(frame)) => {
                            trace!(agent = %label, frame = %frame, "reader: frame received");
                            if frame_tx.send(frame).is_err() {
                                debug!(agent = %label, "reader: frame channel closed, stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let raw = String::from_utf8_lossy(&bytes).into_owned();
                            warn!(
                                agent = %label,
                                error = %e,
                                raw_line = %raw,
                                "reader: parse error, skipping line"
                            );
                            diagnostics.record(Diagnostic::new(
                                None,
                                DiagnosticKind::FrameParse {
                                    line: raw,
                                    error: e.to_string(),
                                },
                            ));
                        }
                    },
                }
            }
        }
    }
}
