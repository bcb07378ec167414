//! Session creation against real child processes.
//!
//! `sh -c` stands in for the agent; the protocol flags land in `$0`, `$1`, …
//! and are ignored by the scripts.

#![cfg(unix)]

use std::time::Duration;

use agent_conduit::backend::process::ProcessBackend;
use agent_conduit::diagnostics::no_diagnostics;
use agent_conduit::session::handshake::{ACK_CONDITION, INIT_CONDITION};
use agent_conduit::transport::spawner::SpawnSpec;
use agent_conduit::transport::{AgentExit, Transport};
use agent_conduit::{AppError, Backend, EngineConfig, SessionOptions};

use super::test_helpers::test_config;

fn shell(script: &str) -> EngineConfig {
    EngineConfig {
        cli_path: "sh".into(),
        cli_args: vec!["-c".into(), script.into()],
        ..test_config()
    }
}

#[tokio::test]
async fn missing_executable_is_spawn_failure() {
    let config = EngineConfig {
        cli_path: "/nonexistent/agent-conduit-test-binary".into(),
        ..test_config()
    };
    let backend = ProcessBackend::new(config, no_diagnostics());

    let err = backend
        .create_session(SessionOptions::default(), "hi".into())
        .await
        .expect_err("nothing to spawn");

    match err {
        AppError::Spawn { reason, .. } => {
            assert!(reason.contains("failed to spawn agent"), "{reason}");
        }
        other => panic!("expected spawn failure, got {other:?}"),
    }
    assert!(backend.sessions().is_empty());
}

/// `wait` resolves with the exit code for every waiter, including one that
/// starts after the process is gone.
#[tokio::test]
async fn wait_reports_exit_code_to_every_waiter() {
    let spec = SpawnSpec {
        program: "sh".into(),
        args: vec!["-c".into(), "exit 7".into()],
        cwd: None,
        inherit_env: true,
        env: std::collections::HashMap::new(),
    };
    let transport = Transport::spawn(&spec, &test_config(), no_diagnostics()).expect("spawn");

    let (first, second) = tokio::join!(transport.wait(), transport.wait());
    assert_eq!(first, AgentExit { code: Some(7) });
    assert_eq!(second, first);

    let late = tokio::time::timeout(Duration::from_secs(1), transport.wait())
        .await
        .expect("already exited");
    assert_eq!(late, AgentExit { code: Some(7) });
    assert_eq!(transport.exit(), Some(late));
}

/// An agent that dies during the handshake reports its code and stderr.
#[tokio::test]
async fn early_exit_carries_code_and_stderr() {
    let backend = ProcessBackend::new(
        shell("echo 'invalid api key' >&2; exit 3"),
        no_diagnostics(),
    );

    let err = backend
        .create_session(SessionOptions::default(), "hi".into())
        .await
        .expect_err("agent exits");

    match err {
        AppError::Spawn { reason, stderr } => {
            assert!(reason.contains("code 3"), "{reason}");
            assert!(stderr.contains("invalid api key"), "{stderr:?}");
        }
        other => panic!("expected spawn failure, got {other:?}"),
    }
}

/// A silent agent times out on both conditions and is killed.
#[tokio::test]
async fn silent_agent_times_out() {
    let backend = ProcessBackend::new(shell("exec sleep 30"), no_diagnostics());
    let options = SessionOptions::default().with_handshake_timeout(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = backend
        .create_session(options, "hi".into())
        .await
        .expect_err("no handshake");

    match err {
        AppError::HandshakeTimeout { missing, .. } => {
            assert_eq!(missing, vec![ACK_CONDITION, INIT_CONDITION]);
        }
        other => panic!("expected handshake timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}
