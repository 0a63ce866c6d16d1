use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;
use vigil_chat::{
    recovery_for, ChatError, ChatEvent, ChatPipeline, ChatSession, PipelineConfig, Role,
};
use vigil_client::{ConnectionManager, ManagerConfig, ReconnectPolicy, SendOutcome, WsTransport};
use vigil_core::identity::StaticIdentity;
use vigil_core::IdentityBinder;
use vigil_telemetry::{init_telemetry, TelemetryConfig};

/// Terminal client for the analysis chat backend.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// WebSocket endpoint.
    #[arg(long, env = "VIGIL_WS_URL", default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
    /// Signed-in user id. Without it the session is anonymous.
    #[arg(long, env = "VIGIL_USER_ID")]
    user_id: Option<String>,
    /// Bearer credential sent in the authenticate frame.
    #[arg(long, env = "VIGIL_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, default_value_t = 30)]
    turn_timeout_secs: u64,
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
    #[arg(long, default_value = "warn")]
    log_level: Level,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
    /// Persist warnings and errors to this SQLite file.
    #[arg(long)]
    log_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut telemetry = TelemetryConfig {
        log_level: args.log_level,
        json: args.json_logs,
        ..Default::default()
    };
    if let Some(path) = &args.log_db {
        telemetry.diagnostics_to_sqlite = true;
        telemetry.diagnostics_db_path = path.clone();
    }
    let _telemetry = init_telemetry(telemetry);

    let binder = Arc::new(match &args.user_id {
        Some(user_id) => IdentityBinder::new(Arc::new(StaticIdentity::new(
            user_id.clone(),
            args.token.clone().map(SecretString::from),
        ))),
        None => IdentityBinder::anonymous(),
    });

    let config = ManagerConfig {
        url: args.url.clone(),
        policy: ReconnectPolicy {
            max_attempts: args.max_attempts,
            ..Default::default()
        },
        ..Default::default()
    };
    let transport = WsTransport::new(config.ws_config());
    let (connection, manager_task) =
        ConnectionManager::spawn(config, transport, Some(Arc::clone(&binder)));
    let (pipeline, pipeline_task) = ChatPipeline::spawn(
        PipelineConfig {
            turn_timeout: Duration::from_secs(args.turn_timeout_secs),
            ..Default::default()
        },
        &connection,
    );
    let session = ChatSession::new(connection, pipeline, binder);
    let _printer = session.subscribe(print_event);

    let mut status = session.watch_status();
    let watcher = tokio::spawn(async move {
        let mut last = status.borrow_and_update().state;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().state;
            if current != last {
                tracing::debug!(from = %last, to = %current, "connection state changed");
                last = current;
            }
        }
    });

    tracing::info!(url = %args.url, client_token = %session.binder().client_token(), "starting session");
    println!("session {}; type a prompt, or /status /connect /disconnect /retry /quit", session.binder().client_token());
    match session.connect().await {
        Ok(_) | Err(ChatError::Connection(_)) => {}
        Err(err) => return Err(err).context("connection manager unavailable"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/status" => {
                let status = session.status();
                println!(
                    "[status] {} attempts={}/{} circuit_open={} authenticated={} queued={}{}",
                    status.state,
                    status.attempts,
                    status.max_attempts,
                    status.circuit_open,
                    status.authenticated,
                    status.queued,
                    status
                        .last_error
                        .map(|e| format!(" last_error=\"{e}\""))
                        .unwrap_or_default(),
                );
            }
            "/connect" => match session.connect().await {
                Ok(outcome) => println!("[connect] {outcome:?}"),
                Err(err) => println!("[connect] refused: {err}"),
            },
            "/disconnect" => {
                session.disconnect().await?;
                println!("[disconnected]");
            }
            "/retry" => match session.retry_connection().await {
                Ok(outcome) => println!("[retry] {outcome:?}"),
                Err(err) => println!("[retry] refused: {err}"),
            },
            prompt => match session.ask(prompt).await {
                Ok(SendOutcome::Sent) | Ok(SendOutcome::Queued { .. }) => {}
                Ok(SendOutcome::Failed) => println!("[not sent] the connection dropped; try again"),
                Err(ChatError::TurnInFlight) => println!("[busy] wait for the current answer"),
                Err(ChatError::EmptyPrompt) => {}
                Err(ChatError::Connection(err)) => {
                    let advice = recovery_for(&err);
                    let hint = if advice.can_retry { " (/retry)" } else { "" };
                    println!("! {}{hint}", advice.message);
                }
                Err(err) => return Err(err.into()),
            },
        }
    }

    session.shutdown().await;
    let _ = tokio::join!(manager_task, pipeline_task);
    watcher.abort();
    Ok(())
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::Thinking { step, .. } => println!("  ... {step}"),
        ChatEvent::ThinkingCleared { .. } => {}
        ChatEvent::Message(msg) => match msg.role {
            Role::User => {}
            Role::Assistant if msg.is_error() => {
                let hint = if msg.metadata.can_retry { " (/retry or ask again)" } else { "" };
                println!("! {}{hint}", msg.content);
            }
            Role::Assistant => {
                let elapsed = msg
                    .metadata
                    .processing_time
                    .map(|s| format!(" [{s:.1}s]"))
                    .unwrap_or_default();
                println!("> {}{elapsed}", msg.content);
            }
            Role::System if msg.is_error() && msg.metadata.can_retry => {
                println!("* {} (/retry)", msg.content)
            }
            Role::System => println!("* {}", msg.content),
        },
    }
}
