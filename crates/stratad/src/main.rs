#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Stratad - strata security gateway daemon
//!
//! This daemon provides:
//! - Public-key challenge-response login with opaque session tokens
//! - Per-method RBAC over the RPC surface
//! - Hash-chained audit log of privileged mutations
//! - Live log tailing for administrators

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratad::api;
use stratad::config::Config;
use stratad::log_buffer::{LogBuffer, LogBufferLayer};
use stratad::state::AppState;

fn normalize_host_for_listen(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

fn parse_listen_host_port(listen: &str) -> anyhow::Result<(String, u16)> {
    let listen = listen.trim();

    if let Ok(addr) = listen.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }

    let idx = listen
        .rfind(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid listen address {listen:?}: expected HOST:PORT"))?;
    let host = listen[..idx].trim_start_matches('[').trim_end_matches(']');
    let port: u16 = listen[idx + 1..]
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {listen:?}: invalid port: {e}"))?;
    Ok((host.to_string(), port))
}

fn format_listen(host: &str, port: u16) -> String {
    let host = normalize_host_for_listen(host);
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Parser)]
#[command(name = "stratad")]
#[command(about = "Strata security gateway daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start {
        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show daemon status
    Status {
        /// Daemon URL
        #[arg(default_value = "http://127.0.0.1:7420")]
        url: String,
    },

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load_default()?
    };

    // Override log level from CLI
    let log_level = match cli.verbose {
        0 => config.tracing_level(),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Initialize logging; every event is also kept for TailLogs
    let log_buffer = Arc::new(LogBuffer::new(
        config.log_buffer.capacity,
        config.log_buffer.subscriber_queue,
    ));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer::new(log_buffer.clone()))
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    match cli.command {
        None | Some(Commands::Start { .. }) => {
            // Apply CLI overrides
            if let Some(Commands::Start { bind, port }) = cli.command {
                if let Some(bind) = bind {
                    let port = match port {
                        Some(p) => p,
                        None => parse_listen_host_port(&config.listen)?.1,
                    };
                    config.listen = format_listen(&bind, port);
                } else if let Some(port) = port {
                    let host = parse_listen_host_port(&config.listen)?.0;
                    config.listen = format_listen(&host, port);
                }
            }

            config.validate()?;
            run_daemon(config, log_buffer).await
        }

        Some(Commands::Status { url }) => check_status(&url).await,

        Some(Commands::ShowConfig) => {
            let yaml = serde_yaml::to_string(&config)?;
            println!("{}", yaml);
            Ok(())
        }
    }
}

async fn run_daemon(config: Config, log_buffer: Arc<LogBuffer>) -> anyhow::Result<()> {
    tracing::info!(
        listen = %config.listen,
        node_id = %config.node_id,
        storage = ?config.storage,
        "Starting stratad"
    );

    // Create application state
    let state = AppState::new(config.clone(), log_buffer)?;
    let maintenance = state.spawn_maintenance();

    // Create router
    let app = api::create_router(state.clone());

    // Parse listen address
    let addr: SocketAddr = config.listen.parse()?;

    // Create listener
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Listening");

    // Setup signal handlers for graceful shutdown
    let shutdown_notify = state.shutdown.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let shutdown_requested = async {
            shutdown_notify.notified().await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            _ = shutdown_requested => {},
        }

        tracing::info!("Shutdown signal received");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    state.background.cancel();
    if let Err(err) = maintenance.await {
        tracing::warn!(error = %err, "Maintenance task ended abnormally");
    }

    tracing::info!(
        calls = state.metrics.calls_total(),
        uptime_secs = state.uptime_secs(),
        "Daemon stopped"
    );

    Ok(())
}

async fn check_status(url: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/health", url)).send().await?;

    if resp.status().is_success() {
        let health: api::HealthResponse = resp.json().await?;
        println!("Status: {}", health.status);
        println!("Version: {}", health.version);
        println!("Node: {}", health.node_id);
        println!("Uptime: {}s", health.uptime_secs);
    } else {
        println!("Error: {} {}", resp.status(), resp.text().await?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_host_port_handles_ipv6() {
        let (host, port) = parse_listen_host_port("[::1]:7420").expect("parse");
        assert_eq!(host, "::1");
        assert_eq!(port, 7420);
    }

    #[test]
    fn parse_listen_host_port_handles_hostname() {
        let (host, port) = parse_listen_host_port("localhost:7420").expect("parse");
        assert_eq!(host, "localhost");
        assert_eq!(port, 7420);
    }

    #[test]
    fn format_listen_brackets_ipv6_hosts() {
        assert_eq!(format_listen("::1", 7420), "[::1]:7420");
        assert_eq!(format_listen("[::1]", 7420), "[::1]:7420");
    }
}
