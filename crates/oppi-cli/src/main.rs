//! # oppi
//!
//! Command-line client for a remote agent host: lists sessions over REST
//! and attaches to one over the multiplexed stream.

#![deny(unsafe_code)]

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use oppi_api::{ControlPlane, CredentialProvider, RestClient, SessionSummary, StaticCredentials};
use oppi_core::SessionId;
use oppi_core::protocol::{ServerFrame, TurnKind, TurnStage};
use oppi_settings::OppiSettings;
use oppi_stream::{
    ConnectionCoordinator, ConnectionEvent, CoordinatorConfig, StageObserver, WsConnector,
};
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

/// oppi client.
#[derive(Parser, Debug)]
#[command(name = "oppi", about = "Attach to remote agent sessions")]
struct Cli {
    /// Server origin (overrides settings).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token.
    #[arg(long, global = true, env = "OPPI_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions on the server.
    Sessions,
    /// List workspaces on the server.
    Workspaces,
    /// Stream a session's events as JSON lines. Stdin lines are sent as
    /// prompts; a leading `!` sends a steer instead.
    Attach {
        /// Session to focus.
        session_id: SessionId,
    },
    /// Send one message and wait for the server to accept it.
    Prompt {
        /// Target session.
        session_id: SessionId,
        /// Message text.
        message: String,
        /// Redirect the running turn instead of starting one.
        #[arg(long, conflicts_with = "follow_up")]
        steer: bool,
        /// Queue after the running turn.
        #[arg(long)]
        follow_up: bool,
    },
}

fn load_settings(cli: &Cli) -> Result<OppiSettings> {
    let mut settings = oppi_settings::load_settings().unwrap_or_else(|err| {
        eprintln!("warning: failed to load settings ({err}), using defaults");
        OppiSettings::default()
    });
    if let Some(base_url) = &cli.base_url {
        settings.server.base_url.clone_from(base_url);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn rest_client(settings: &OppiSettings, credentials: Arc<dyn CredentialProvider>) -> RestClient {
    RestClient::new(credentials).with_timeout(Duration::from_millis(settings.rest.timeout_ms))
}

fn coordinator(
    settings: &OppiSettings,
    credentials: Arc<dyn CredentialProvider>,
) -> ConnectionCoordinator {
    let config = CoordinatorConfig::from(settings);
    let connector = WsConnector::new(
        credentials.clone(),
        config.transport.stream_path.clone(),
        config.transport.connect_timeout,
    );
    let rest: Arc<dyn ControlPlane> = Arc::new(rest_client(settings, credentials));
    ConnectionCoordinator::new(Arc::new(connector), config, Some(rest))
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

fn print_sessions(sessions: &[SessionSummary]) {
    println!(
        "{:<28} {:<10} {:<24} {:>6} {:>8}  {:<16}  LAST ACTIVITY",
        "ID", "STATUS", "MODEL", "MSGS", "COST", "CREATED"
    );
    for s in sessions {
        println!(
            "{:<28} {:<10} {:<24} {:>6} {:>8.3}  {:<16}  {}",
            s.id,
            s.status,
            s.model.as_deref().unwrap_or("-"),
            s.message_count,
            s.cost,
            format_time(s.created_at_utc()),
            format_time(s.last_activity_utc()),
        );
    }
}

fn print_frame(frame: &ServerFrame) -> Result<()> {
    let line = serde_json::to_string(frame).context("Failed to encode frame")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Send a turn without blocking the event loop; stages go to stderr.
fn spawn_turn(
    coordinator: &ConnectionCoordinator,
    session_id: &SessionId,
    kind: TurnKind,
    message: &str,
) {
    let (coordinator, session_id, message) =
        (coordinator.clone(), session_id.clone(), message.to_owned());
    let name = kind.command_name();
    let observer: StageObserver = Arc::new(move |stage: &TurnStage| eprintln!("{name}: {stage}"));
    let _ = tokio::spawn(async move {
        if let Err(error) = coordinator
            .send_turn(kind, &session_id, &message, Vec::new(), Some(observer))
            .await
        {
            eprintln!("{name} failed: {error}");
        }
    });
}

async fn attach(coordinator: &ConnectionCoordinator, session_id: &SessionId) -> Result<()> {
    let mut events = coordinator.events();
    let mut stream = coordinator
        .stream_session(session_id)
        .await
        .with_context(|| format!("Failed to subscribe to {session_id}"))?;
    info!(session_id = %session_id, "attached");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            frame = stream.recv() => {
                let Some(frame) = frame else {
                    warn!(session_id = %session_id, "session stream closed");
                    return Ok(());
                };
                print_frame(&frame)?;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    stdin_open = false;
                    continue;
                };
                let (kind, message) = match line.strip_prefix('!') {
                    Some(rest) => (TurnKind::Steer, rest.trim()),
                    None => (TurnKind::Prompt, line.trim()),
                };
                if message.is_empty() {
                    continue;
                }
                spawn_turn(coordinator, session_id, kind, message);
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::StatusChanged(status)) => info!(status = status.as_str(), "connection"),
                Ok(ConnectionEvent::ResubscribeFailed { error, .. }) => {
                    bail!("lost session {session_id}: {error}");
                }
                Ok(ConnectionEvent::SessionSnapshot(summary)) => {
                    info!(status = %summary.status, messages = summary.message_count, "refreshed over REST");
                }
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn prompt(
    coordinator: &ConnectionCoordinator,
    session_id: &SessionId,
    kind: TurnKind,
    message: &str,
) -> Result<()> {
    let _stream = coordinator
        .stream_session(session_id)
        .await
        .with_context(|| format!("Failed to subscribe to {session_id}"))?;
    let outcome = coordinator
        .send_turn(kind, session_id, message, Vec::new(), None)
        .await
        .with_context(|| format!("{} failed", kind.command_name()))?;
    let stage = outcome
        .stage
        .map_or_else(|| "accepted".to_string(), |stage| stage.to_string());
    println!(
        "{} {} (turn {}, {} attempt(s))",
        kind.command_name(),
        stage,
        outcome.turn_id,
        outcome.attempts
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    oppi_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let token = cli
        .token
        .clone()
        .context("No token: pass --token or set OPPI_TOKEN")?;
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(StaticCredentials::new(settings.server.base_url.clone(), token));

    match cli.command {
        Command::Sessions => {
            let sessions = rest_client(&settings, credentials)
                .list_sessions()
                .await
                .context("Failed to list sessions")?;
            print_sessions(&sessions);
        }
        Command::Workspaces => {
            let workspaces = rest_client(&settings, credentials)
                .list_workspaces()
                .await
                .context("Failed to list workspaces")?;
            for w in workspaces {
                println!("{:<28} {}", w.id, w.name);
            }
        }
        Command::Attach { session_id } => {
            let coordinator = coordinator(&settings, credentials);
            let result = attach(&coordinator, &session_id).await;
            coordinator.teardown();
            result?;
        }
        Command::Prompt {
            session_id,
            message,
            steer,
            follow_up,
        } => {
            let kind = if steer {
                TurnKind::Steer
            } else if follow_up {
                TurnKind::FollowUp
            } else {
                TurnKind::Prompt
            };
            let coordinator = coordinator(&settings, credentials);
            let result = prompt(&coordinator, &session_id, kind, &message).await;
            coordinator.teardown();
            result?;
        }
    }
    Ok(())
}
