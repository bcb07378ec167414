//! Transport writer task.
//!
//! Receives outbound frames from an unbounded [`mpsc`] channel, encodes each
//! with [`encode_line`], and writes the NDJSON line to the agent's stdin.
//!
//! This task is the only writer of its stream, so frames are never
//! interleaved mid-line.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::codec::encode_line;
use crate::{AppError, Result};

/// Writer task: serialises outbound frames and writes them to `stdin`.
///
/// Exits cleanly when `cancel` fires or every sender is dropped.
///
/// # Errors
///
/// - [`AppError::Protocol`] if a frame cannot be serialised.
/// - [`AppError::Io`]`("write failed: …")` if the write fails (the agent has
///   exited or closed its stdin).
pub async fn run_writer<W>(
    label: String,
    stdin: W,
    mut frame_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(agent = %label, "writer: cancellation received, stopping");
                break;
            }

            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(agent = %label, "writer: frame channel closed, stopping");
                    break;
                };

                let line = encode_line(&frame)?;
                trace!(agent = %label, line = line.trim_end(), "writer: sending frame");

                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;

                if let Err(e) = written {
                    warn!(agent = %label, error = %e, "writer: write to stdin failed");
                    return Err(AppError::Io(format!("write failed: {e}")));
                }
            }
        }
    }

    // Closing stdin lets a well-behaved agent observe end of input.
    let _ = stdin.shutdown().await;
    Ok(())
}
