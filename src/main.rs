#![forbid(unsafe_code)]

//! `agent-conduit`: run one prompt through an agent session.
//!
//! Every session message is printed to stdout as one JSON line. Logs go to
//! stderr or to the configured log file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::backend;
use agent_conduit::diagnostics::no_diagnostics;
use agent_conduit::{
    AppError, CallbackRequest, EngineConfig, Result, SessionMessage, SessionOptions, UserContent,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Drive an agent session over stdio", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// First user message.
    #[arg(long)]
    prompt: String,

    /// Model override.
    #[arg(long)]
    model: Option<String>,

    /// Permission mode override.
    #[arg(long)]
    permission_mode: Option<String>,

    /// Route the session through one multiplexed broker process.
    #[arg(long)]
    multiplexed: bool,

    /// Tool allowed when the agent asks for permission. Repeatable.
    #[arg(long = "allow-tool")]
    allow_tools: Vec<String>,

    /// Exit after this many completed turns.
    #[arg(long, default_value_t = 1)]
    turns: u32,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env_overrides()?;

    init_tracing(args.log_format, &config)?;
    info!(cli_path = %config.cli_path, multiplexed = args.multiplexed, "agent-conduit starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args, config))
}

async fn run(args: Cli, config: EngineConfig) -> Result<()> {
    let backend = backend::from_config(config, args.multiplexed, no_diagnostics())?;
    let mut backend_errors = backend.take_errors();

    let mut options = SessionOptions::default();
    if let Some(model) = &args.model {
        options = options.with_model(model.clone());
    }
    if let Some(mode) = &args.permission_mode {
        options = options.with_permission_mode(mode.clone());
    }

    let prompt = UserContent::from(args.prompt.as_str());
    let session = tokio::select! {
        created = backend.create_session(options, prompt) => created?,
        signal = shutdown_signal() => {
            info!(signal, "shutdown signal received during startup");
            backend.dispose();
            return Ok(());
        }
    };
    info!(session_id = session.id(), model = ?session.init().model, "session ready");

    let mut messages = session
        .take_messages()
        .ok_or_else(|| AppError::Protocol("message stream already taken".into()))?;
    let mut callbacks = session
        .take_callbacks()
        .ok_or_else(|| AppError::Protocol("callback stream already taken".into()))?;

    let mut completed = 0u32;
    let outcome = loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else {
                    break Err(AppError::Disposed("session closed".into()));
                };
                print_message(&message)?;
                if message.is_turn_complete() {
                    completed += 1;
                    debug!(completed, "turn complete");
                    if completed >= args.turns {
                        break Ok(());
                    }
                }
            }
            Some(request) = callbacks.recv() => {
                if let Err(err) = answer(&request, &args.allow_tools) {
                    warn!(%err, callback = request.id(), "callback answer failed");
                }
            }
            Some(err) = async {
                match backend_errors.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                error!(%err, "backend error");
                break Err(err);
            }
            signal = shutdown_signal() => {
                info!(signal, "shutdown signal received");
                break Ok(());
            }
        }
    };

    backend.dispose();
    info!(turns = completed, "agent-conduit shut down");
    outcome
}

fn print_message(message: &SessionMessage) -> Result<()> {
    let line = serde_json::to_string(message.raw())?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn answer(request: &CallbackRequest, allowed: &[String]) -> Result<()> {
    match request {
        CallbackRequest::Permission(permission) => {
            if allowed.iter().any(|tool| tool == permission.tool_name()) {
                info!(tool = permission.tool_name(), "tool allowed");
                permission.allow(None)
            } else {
                info!(tool = permission.tool_name(), "tool denied");
                permission.deny(None)
            }
        }
        CallbackRequest::Hook(hook) => hook.approve(),
    }
}

/// Resolve with the name of the first termination signal received.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                error!(%err, "ctrl-c handler unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

fn init_tracing(log_format: LogFormat, config: &EngineConfig) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(path) = &config.log_file else {
        let subscriber = fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr);
        match log_format {
            LogFormat::Text => subscriber
                .try_init()
                .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
            LogFormat::Json => subscriber
                .json()
                .try_init()
                .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        }
        return Ok(());
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::Config(format!("cannot open log file: {err}")))?;
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file));
    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
