//! # acp-daemon
//!
//! Agent task control plane daemon.
//!
//! `serve` runs the HTTP control plane and the reconciliation loop over one
//! data directory. `relay` runs a stateless gateway that forwards task
//! requests to a remote control plane. `events` inspects the event log
//! offline; `token` prints a fresh bearer token.
//!
//! ## Usage
//!
//! ```text
//! acp-daemon token > .acp-token
//! ACP_TOKEN=$(cat .acp-token) acp-daemon serve --data-dir /var/lib/acp
//! acp-daemon events tail --data-dir /var/lib/acp --since 120
//! ```

mod api;
mod auth;
mod config;
mod driver;
mod error;
mod relay;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use acp_control::{ControlPlane, NoopBackend};
use acp_events::JsonlEventLog;

use crate::auth::BearerToken;
use crate::config::{ConfigArgs, DaemonConfig};

/// Agent task control plane.
#[derive(Parser)]
#[command(name = "acp-daemon", version, about = "Agent task control plane")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control plane and the reconciliation loop.
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Run the relay gateway in front of a remote control plane.
    Relay {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Inspect the local event log.
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    /// Print a freshly generated bearer token.
    Token,
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Print events after a sequence number, one JSON object per line.
    Tail {
        #[arg(long, env = "ACP_DATA_DIR", default_value = ".acp")]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Check sequence numbers and the hash chain of the whole log.
    Verify {
        #[arg(long, env = "ACP_DATA_DIR", default_value = ".acp")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Serve { config } => serve(&config).await,
        Command::Relay { config } => run_relay(&config).await,
        Command::Events { command } => events(command),
        Command::Token => {
            println!("{}", auth::generate_token());
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    // Logs go to stderr so `events tail` output stays clean on stdout.
    let filter = EnvFilter::from_default_env()
        .add_directive("acp_daemon=info".parse()?)
        .add_directive("acp_control=info".parse()?);
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

async fn serve(args: &ConfigArgs) -> Result<()> {
    let config = DaemonConfig::resolve(args)?;
    let token = match &config.token {
        Some(token) => token.clone(),
        None => {
            let token = auth::generate_token();
            tracing::warn!(token = %token, "no token configured; generated one for this run");
            token
        }
    };

    let control = config.control_config()?;
    let plane = ControlPlane::open(&control, Arc::new(NoopBackend)).with_context(|| {
        format!(
            "failed to open control plane state in {}",
            config.data_dir.display()
        )
    })?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let (stop_loop, loop_stopped) = watch::channel(false);
    let reconcile = driver::spawn(
        plane.reconciler.clone(),
        control.reconcile_interval,
        loop_stopped,
    );

    tracing::info!(
        %addr,
        data_dir = %config.data_dir.display(),
        max_running = control.max_running,
        "control plane listening"
    );
    let app = api::app(plane.router.clone(), BearerToken::new(token));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control plane server failed")?;

    let _ = stop_loop.send(true);
    reconcile.await.context("reconciliation loop panicked")?;
    tracing::info!("control plane stopped");
    Ok(())
}

async fn run_relay(args: &ConfigArgs) -> Result<()> {
    let config = DaemonConfig::resolve(args)?;
    let token = config
        .token
        .clone()
        .context("relay requires a local token (--token or ACP_TOKEN)")?;
    let upstream = config
        .relay
        .upstream
        .clone()
        .context("relay requires --upstream or ACP_UPSTREAM")?;
    let upstream_token = config
        .relay
        .upstream_token
        .clone()
        .context("relay requires --upstream-token or ACP_UPSTREAM_TOKEN")?;

    let state = relay::RelayState::new(
        &upstream,
        &upstream_token,
        Duration::from_millis(config.relay.timeout_ms),
    )?;
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(%addr, upstream = %upstream, "relay listening");
    axum::serve(listener, relay::app(state, BearerToken::new(token)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server failed")?;
    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn events(command: EventsCommand) -> Result<()> {
    match command {
        EventsCommand::Tail {
            data_dir,
            since,
            limit,
        } => {
            let path = events_path(&data_dir);
            let events = JsonlEventLog::read_all(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            for event in events.iter().filter(|e| e.seq > since).take(limit) {
                println!("{}", serde_json::to_string(event)?);
            }
            Ok(())
        }
        EventsCommand::Verify { data_dir } => {
            let path = events_path(&data_dir);
            let count = JsonlEventLog::verify_chain(&path)
                .with_context(|| format!("event log {} failed verification", path.display()))?;
            println!("{}: {} events, chain intact", path.display(), count);
            Ok(())
        }
    }
}

fn events_path(data_dir: &Path) -> PathBuf {
    data_dir.join("events.jsonl")
}
