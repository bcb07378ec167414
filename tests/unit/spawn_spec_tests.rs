//! Unit tests for agent command-line construction.

use std::path::PathBuf;

use agent_conduit::config::EngineConfig;
use agent_conduit::session::SessionOptions;
use agent_conduit::transport::spawner::{SpawnSpec, PROTOCOL_ARGS};

fn config() -> EngineConfig {
    EngineConfig {
        cli_path: "/usr/bin/claude".into(),
        cli_args: vec!["--no-color".into()],
        ..EngineConfig::default()
    }
}

#[test]
fn protocol_flags_follow_configured_args() {
    let spec = SpawnSpec::for_session(&config(), &SessionOptions::default());
    assert_eq!(spec.program, "/usr/bin/claude");
    assert_eq!(spec.args[0], "--no-color");
    assert_eq!(&spec.args[1..], PROTOCOL_ARGS);
}

#[test]
fn session_options_become_flags() {
    let options = SessionOptions::default()
        .with_permission_mode("acceptEdits")
        .with_resume("sess-old")
        .with_partial_messages(true)
        .with_disallowed_tools(["WebFetch"]);
    let spec = SpawnSpec::for_session(&config(), &options);
    let args = spec.args.join(" ");

    assert!(args.contains("--permission-mode acceptEdits"));
    assert!(args.contains("--resume sess-old"));
    assert!(args.contains("--include-partial-messages"));
    assert!(args.contains("--disallowedTools WebFetch"));
    assert!(!args.contains("--model"), "unset options add no flags");
}

#[test]
fn session_env_and_cwd_override_config() {
    let mut config = config();
    config.env.insert("A".into(), "config".into());
    config.env.insert("B".into(), "config".into());
    let options = SessionOptions::default()
        .with_env("B", "session")
        .with_cwd("/work/repo");

    let spec = SpawnSpec::for_session(&config, &options);
    assert_eq!(spec.env.get("A").map(String::as_str), Some("config"));
    assert_eq!(spec.env.get("B").map(String::as_str), Some("session"));
    assert_eq!(spec.cwd, Some(PathBuf::from("/work/repo")));
}

#[test]
fn broker_command_omits_protocol_flags() {
    let spec = SpawnSpec::for_broker(&config());
    assert_eq!(spec.args, vec!["--no-color".to_owned(), "--multiplex".to_owned()]);
    assert!(spec.cwd.is_none());
}
