//! Stdio transport to one agent process.
//!
//! A [`Transport`] owns the child process and three background tasks:
//! - `reader`: stdout → [`LineCodec`](codec::LineCodec) → JSON frames on an
//!   unbounded channel, in pipe order;
//! - `writer`: the only writer of stdin, so outbound frames never interleave;
//! - `stderr`: drains stderr into a bounded [`StderrRing`].
//!
//! A fourth task supervises the child and publishes its exit through a
//! [`watch`] channel. Killing is idempotent: the first call sends SIGTERM,
//! escalates to SIGKILL after the configured grace, and every later call is a
//! no-op. Dropping the transport kills it too.
//!
//! [`Transport::from_io`] builds the same surface over arbitrary async pipes,
//! which is how in-memory agents are wired up in tests.

pub mod codec;
pub mod reader;
pub mod spawner;
pub mod stderr;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::diagnostics::SharedDiagnostics;
use crate::transport::spawner::{spawn_agent, SpawnSpec};
use crate::transport::stderr::StderrRing;
use crate::{AppError, Result};

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    /// Exit code; `None` when terminated by a signal or when there is no
    /// process behind the transport.
    pub code: Option<i32>,
}

/// Handle to one agent's stdio channel and process lifecycle.
#[derive(Debug)]
pub struct Transport {
    label: String,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Value>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    stderr: StderrRing,
    stderr_done: CancellationToken,
    exit: watch::Receiver<Option<AgentExit>>,
    cancel: CancellationToken,
    killed: AtomicBool,
}

impl Transport {
    /// Launch the process described by `spec` and start its I/O tasks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be started.
    pub fn spawn(
        spec: &SpawnSpec,
        config: &EngineConfig,
        diagnostics: SharedDiagnostics,
    ) -> Result<Self> {
        let agent = spawn_agent(spec)?;
        let pid = agent.child.id();
        let label = match pid {
            Some(pid) => format!("{}[{pid}]", spec.program),
            None => spec.program.clone(),
        };

        let cancel = CancellationToken::new();
        let stderr = StderrRing::new(config.stderr_capacity);
        let stderr_done = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let (outbound, inbound) = start_io(
            &label,
            agent.stdout,
            agent.stdin,
            config.max_line_bytes,
            &diagnostics,
            &cancel,
        );

        {
            let label = label.clone();
            let ring = stderr.clone();
            let done = stderr_done.clone();
            let pipe = agent.stderr;
            let diagnostics = diagnostics.clone();
            tokio::spawn(async move {
                stderr::run_capture(label, pipe, ring, diagnostics).await;
                done.cancel();
            });
        }

        tokio::spawn(supervise(
            label.clone(),
            agent.child,
            cancel.clone(),
            config.kill_grace(),
            exit_tx,
        ));

        Ok(Self {
            label,
            pid,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            stderr,
            stderr_done,
            exit: exit_rx,
            cancel,
            killed: AtomicBool::new(false),
        })
    }

    /// Build a transport over existing pipes with no process behind them.
    ///
    /// The transport counts as exited (code `None`) once `reader` reaches EOF
    /// or the transport is killed.
    pub fn from_io<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        max_line_bytes: usize,
        diagnostics: SharedDiagnostics,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (frame_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, frame_rx) = mpsc::unbounded_channel();

        {
            let label = label.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                reader::run_reader(label, reader, max_line_bytes, frame_tx, diagnostics, cancel)
                    .await;
                exit_tx.send_replace(Some(AgentExit { code: None }));
            });
        }
        spawn_writer(label.clone(), writer, frame_rx, cancel.clone());

        let stderr_done = CancellationToken::new();
        stderr_done.cancel();

        Self {
            label,
            pid: None,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            stderr: StderrRing::new(1),
            stderr_done,
            exit: exit_rx,
            cancel,
            killed: AtomicBool::new(false),
        }
    }

    /// Human-readable label used in log fields.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, when there is a process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one frame for the writer task.
    ///
    /// Never waits; ordering across calls is preserved.
    ///
    /// # Errors
    ///
    /// - `AppError::Disposed` after [`kill`](Self::kill).
    /// - `AppError::Io` if the writer has stopped (stdin closed).
    pub fn send(&self, frame: Value) -> Result<()> {
        if self.is_killed() {
            return Err(AppError::Disposed(format!("transport {} killed", self.label)));
        }
        self.outbound
            .send(frame)
            .map_err(|_| AppError::Io(format!("agent {} stdin closed", self.label)))
    }

    /// Take the inbound frame stream. Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.inbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Kill the agent. Idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(agent = %self.label, "killing agent transport");
        self.cancel.cancel();
    }

    /// Whether [`kill`](Self::kill) has been called.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Exit status, if the process has ended.
    #[must_use]
    pub fn exit(&self) -> Option<AgentExit> {
        *self.exit.borrow()
    }

    /// Wait for the process to end.
    pub async fn wait(&self) -> AgentExit {
        let mut rx = self.exit.clone();
        let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit);
        exit.unwrap_or(AgentExit { code: None })
    }

    /// Recent stderr lines joined with `\n`.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr.tail()
    }

    /// Stderr tail after the capture task has drained, waiting at most `bound`.
    pub async fn settled_stderr_tail(&self, bound: Duration) -> String {
        let _ = tokio::time::timeout(bound, self.stderr_done.cancelled()).await;
        self.stderr.tail()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn start_io<R, W>(
    label: &str,
    stdout: R,
    stdin: W,
    max_line_bytes: usize,
    diagnostics: &SharedDiagnostics,
    cancel: &CancellationToken,
) -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frame_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, frame_rx) = mpsc::unbounded_channel();

    tokio::spawn(reader::run_reader(
        label.to_owned(),
        stdout,
        max_line_bytes,
        frame_tx,
        diagnostics.clone(),
        cancel.clone(),
    ));
    spawn_writer(label.to_owned(), stdin, frame_rx, cancel.clone());

    (outbound, inbound)
}

fn spawn_writer<W>(
    label: String,
    stdin: W,
    frame_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = writer::run_writer(label.clone(), stdin, frame_rx, cancel).await {
            warn!(agent = %label, %err, "writer task ended with error");
        }
    });
}

/// Own the child until it exits, or terminate it when `cancel` fires.
async fn supervise(
    label: String,
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
    exit_tx: watch::Sender<Option<AgentExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = cancel.cancelled() => terminate(&label, &mut child, grace).await,
    };

    let exit = match status {
        Ok(status) => AgentExit {
            code: status.code(),
        },
        Err(err) => {
            warn!(agent = %label, %err, "error waiting for agent child process");
            AgentExit { code: None }
        }
    };
    debug!(agent = %label, code = ?exit.code, "agent process exited");
    exit_tx.send_replace(Some(exit));
}

/// SIGTERM, then SIGKILL once `grace` elapses.
async fn terminate(
    label: &str,
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            warn!(agent = %label, ?grace, "agent ignored SIGTERM, sending SIGKILL");
        }
    }

    #[cfg(not(unix))]
    let _ = (label, grace);

    child.kill().await?;
    child.wait().await
}
