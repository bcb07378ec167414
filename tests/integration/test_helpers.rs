//! Shared helpers for engine integration tests.
//!
//! A [`FakeAgent`] is the far end of a [`Transport`] built over in-memory
//! duplex pipes: tests read what the engine wrote and script the agent's
//! replies line by line.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;

use agent_conduit::backend::process::{Launcher, ProcessBackend};
use agent_conduit::diagnostics::{ChannelDiagnostics, Diagnostic, SharedDiagnostics};
use agent_conduit::transport::codec::MAX_LINE_BYTES;
use agent_conduit::transport::Transport;
use agent_conduit::{AppError, EngineConfig, Result, SessionOptions};

/// Upper bound for any single scripted step.
pub const STEP: Duration = Duration::from_secs(5);

/// Config with short grace periods so teardown paths finish quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        handshake_timeout_seconds: 5,
        kill_grace_millis: 200,
        ..EngineConfig::default()
    }
}

/// Scripted far end of one transport.
pub struct FakeAgent {
    lines: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
}

impl FakeAgent {
    /// Next frame the engine wrote.
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("engine wrote nothing in time")
            .expect("read engine output")
            .expect("engine closed its output");
        serde_json::from_str(&line).expect("engine wrote valid json")
    }

    /// Next frame, asserting its `type`.
    pub async fn recv_type(&mut self, frame_type: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], frame_type, "unexpected frame: {frame}");
        frame
    }

    /// Write one frame to the engine.
    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    /// Write one raw line to the engine.
    pub async fn send_raw(&mut self, line: &str) {
        self.stdout
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write to engine");
    }

    /// Resolves once the engine has closed its side of the pipe.
    pub async fn expect_closed(&mut self) {
        loop {
            let next = tokio::time::timeout(STEP, self.lines.next_line())
                .await
                .expect("engine did not close its output in time");
            match next {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }

    /// Answer the process-topology handshake and return the `initialize`
    /// request and the first user message, in the order they were written.
    pub async fn accept_session(&mut self, session_id: &str, init_first: bool) -> (Value, Value) {
        let initialize = self.recv_type("control_request").await;
        assert_eq!(initialize["request"]["subtype"], "initialize");
        // The user message must already be on the wire before any reply.
        let user = self.recv_type("user").await;

        let request_id = initialize["request_id"]
            .as_str()
            .expect("initialize carries a request id")
            .to_owned();
        if init_first {
            self.send(init_frame(session_id)).await;
            self.send(ack_frame(&request_id)).await;
        } else {
            self.send(ack_frame(&request_id)).await;
            self.send(init_frame(session_id)).await;
        }
        (initialize, user)
    }
}

/// Build a transport and the fake agent on its far end.
pub fn fake_pipe(label: &str, diagnostics: SharedDiagnostics) -> (Transport, FakeAgent) {
    let (engine_stdout, agent_stdout) = tokio::io::duplex(64 * 1024);
    let (engine_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
    let transport = Transport::from_io(
        label,
        engine_stdout,
        engine_stdin,
        MAX_LINE_BYTES,
        diagnostics,
    );
    let agent = FakeAgent {
        lines: BufReader::new(agent_stdin).lines(),
        stdout: agent_stdout,
    };
    (transport, agent)
}

/// `system/init` for `session_id`.
pub fn init_frame(session_id: &str) -> Value {
    json!({
        "type": "system",
        "subtype": "init",
        "session_id": session_id,
        "model": "claude-test",
        "permissionMode": "default",
        "cwd": "/work",
        "tools": ["Bash", "Read"],
        "slash_commands": ["compact"]
    })
}

/// Successful `control_response` for `request_id`.
pub fn ack_frame(request_id: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {"commands": []}
        }
    })
}

/// Failed `control_response` for `request_id`.
pub fn error_frame(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": request_id, "error": error}
    })
}

/// `result` frame closing one turn.
pub fn result_frame(session_id: &str) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "session_id": session_id,
        "is_error": false,
        "num_turns": 1,
        "total_cost_usd": 0.0125,
        "result": "done",
        "usage": {"input_tokens": 10, "output_tokens": 4}
    })
}

/// `assistant` frame carrying one text block.
pub fn assistant_frame(session_id: &str, text: &str) -> Value {
    json!({
        "type": "assistant",
        "session_id": session_id,
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
    })
}

/// Launcher handing out pre-built transports in order.
pub struct ScriptedLauncher {
    transports: Mutex<VecDeque<Transport>>,
    launched: Mutex<Vec<SessionOptions>>,
}

impl ScriptedLauncher {
    /// Options of every launch so far.
    pub fn launched(&self) -> Vec<SessionOptions> {
        self.launched.lock().unwrap().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, options: &SessionOptions) -> Result<Transport> {
        self.launched.lock().unwrap().push(options.clone());
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AppError::Spawn {
                reason: "no scripted agent left".into(),
                stderr: String::new(),
            })
    }
}

/// A process backend whose launches are served by `count` fake agents.
pub struct ScriptedBackend {
    pub backend: ProcessBackend,
    pub launcher: Arc<ScriptedLauncher>,
    pub agents: VecDeque<FakeAgent>,
    pub diagnostics: mpsc::UnboundedReceiver<Diagnostic>,
}

/// Build a [`ScriptedBackend`] with `count` agents.
pub fn scripted_backend(count: usize, config: EngineConfig) -> ScriptedBackend {
    let (sink, diagnostics) = ChannelDiagnostics::new();
    let sink: SharedDiagnostics = Arc::new(sink);

    let mut transports = VecDeque::new();
    let mut agents = VecDeque::new();
    for i in 0..count {
        let (transport, agent) = fake_pipe(&format!("fake-{i}"), sink.clone());
        transports.push_back(transport);
        agents.push_back(agent);
    }

    let launcher = Arc::new(ScriptedLauncher {
        transports: Mutex::new(transports),
        launched: Mutex::new(Vec::new()),
    });
    let backend = ProcessBackend::with_launcher(config, launcher.clone(), sink);
    ScriptedBackend {
        backend,
        launcher,
        agents,
        diagnostics,
    }
}

/// Receive with the step timeout.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("nothing received in time")
}
