//! TermBridge server
//!
//! Serves interactive shell sessions over WebSocket and accepts injected
//! commands over HTTP.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::protocol::{InjectRequest, InjectResponse};
use daemon::session::SessionMode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// TermBridge - remote interactive shells over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server
    Start {
        /// Port to listen on (overrides config and PORT)
        #[arg(long, short)]
        port: Option<u16>,

        /// Session mode
        #[arg(long, short, value_enum)]
        mode: Option<SessionMode>,

        /// Shell to spawn for sessions
        #[arg(long, short)]
        shell: Option<String>,
    },

    /// Send a command to a running session
    Inject {
        /// Connection ID of the target session (not needed in shared mode)
        #[arg(long = "connection-id", short = 'i')]
        connection_id: Option<String>,

        /// Command line to submit
        command: String,

        /// Server base URL (defaults to the configured local port)
        #[arg(long)]
        url: Option<String>,
    },

    /// Show server status
    Status {
        /// Server base URL (defaults to the configured local port)
        #[arg(long)]
        url: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing .env file is fine.
    let dotenv = dotenvy::dotenv();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    let env_overrides = config.apply_env_overrides();

    let _log_guard = init_logging(&config, cli.verbose)?;
    for env_override in &env_overrides {
        env_override.log();
    }
    if let Ok(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start { port, mode, shell } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(mode) = mode {
                config.session.mode = mode;
            }
            if let Some(shell) = shell {
                config.session.default_shell = shell;
            }
            config.validate()?;

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Inject {
            connection_id,
            command,
            url,
        } => {
            let base = url.unwrap_or_else(|| local_url(&config));
            let request = InjectRequest {
                connection_id,
                command: Some(command),
            };
            let response = inject_command(&base, &request).await?;
            println!("{}", response.message);
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Status { url } => {
            let base = url.unwrap_or_else(|| local_url(&config));
            match query_status(&base).await {
                Ok(status) => print_status(&base, &status),
                Err(e) => {
                    println!("TermBridge Status");
                    println!("=================");
                    println!();
                    println!("Status: Not running ({})", base);
                    tracing::debug!("Status query failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config { default } => {
            let config = if default { Config::default() } else { config };
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `--verbose` forces debug.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

fn file_appender(path: &Path) -> anyhow::Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    Ok(tracing_appender::rolling::daily(dir, file_name))
}

fn local_url(config: &Config) -> String {
    format!("http://127.0.0.1:{}", config.server.port)
}

/// Calls the command injection endpoint.
async fn inject_command(base: &str, request: &InjectRequest) -> anyhow::Result<InjectResponse> {
    let url = format!("{}/api/command", base.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(request)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {}", base))?;

    let status = response.status();
    let body: InjectResponse = response
        .json()
        .await
        .with_context(|| format!("Unexpected response from server ({})", status))?;
    Ok(body)
}

/// Queries `/health`.
async fn query_status(base: &str) -> anyhow::Result<serde_json::Value> {
    let url = format!("{}/health", base.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach server at {}", base))?
        .error_for_status()?;
    Ok(response.json().await?)
}

fn print_status(base: &str, status: &serde_json::Value) {
    println!("TermBridge Status");
    println!("=================");
    println!();
    println!("Status:      Running ({})", base);
    println!("Mode:        {}", status["mode"].as_str().unwrap_or("unknown"));
    println!("Sessions:    {}", status["sessions"].as_u64().unwrap_or(0));
    println!("Connections: {}", status["connections"].as_u64().unwrap_or(0));
}

/// Run the server until a shutdown signal arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();

    // Spawn event logging task
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { connection_id } => {
                    tracing::debug!("Client connected: {}", connection_id);
                }
                OrchestratorEvent::ClientDisconnected {
                    connection_id,
                    reason,
                } => {
                    tracing::debug!("Client disconnected: {} ({})", connection_id, reason);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
