//! agentport - console entry point
//!
//! Connects to a remote agent per a TOML connection profile, wires the local
//! terminal to the agent's shell, and prints inbound events and log records
//! until interrupted.

use agentport::config::{ConnectionParams, ConsoleConfig};
use agentport::observability::init_default_logging;
use agentport::protocol::{AgentEvent, AgentLogEntry};
use agentport::supervisor::{EventListener, LogListener, OutputSink, RpcSupervisor};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Remote agent console
#[derive(Parser)]
#[command(name = "agentport")]
#[command(about = "Connection supervisor console for remote managed agents")]
#[command(version)]
struct Cli {
    /// Connection profile path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the agent and run interactively
    Run,
    /// Validate the connection profile
    Config {
        /// Show the parsed profile
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load connection profile: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_console(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {e}");
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ConsoleConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading connection profile from: {}", path.display());
            Ok(ConsoleConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["agentport.toml", "config/agentport.toml"];
            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading connection profile from: {}", path.display());
                    return Ok(ConsoleConfig::load_from_file(&path)?);
                }
            }
            Err("no connection profile found; pass one with -c/--config or create agentport.toml"
                .into())
        }
    }
}

struct ConsoleOut;

impl OutputSink for ConsoleOut {
    fn append(&self, text: &str) {
        print!("{text}");
    }
}

struct ConsoleErr;

impl OutputSink for ConsoleErr {
    fn append(&self, text: &str) {
        eprint!("{text}");
    }
}

struct EventPrinter;

impl EventListener for EventPrinter {
    fn topics(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    fn on_event(&self, event: &AgentEvent) {
        info!(topic = %event.topic, "agent event");
    }
}

struct LogPrinter;

impl LogListener for LogPrinter {
    fn logged(&self, entry: &AgentLogEntry) {
        info!(level = ?entry.level, "[agent] {}", entry.message);
    }
}

async fn run_console(config: ConsoleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = RpcSupervisor::with_retry(config.retry.clone());
    if let Some(shell) = config.shell {
        supervisor.set_shell(shell);
    }

    supervisor.add_event_listener(Arc::new(EventPrinter));
    supervisor.add_log_listener(Arc::new(LogPrinter));

    match &config.connection {
        ConnectionParams::Socket(params) => supervisor.connect_socket(params).await?,
        ConnectionParams::Broker(params) => supervisor.connect_broker(params).await?,
    }

    supervisor
        .set_streams(Arc::new(ConsoleOut), Arc::new(ConsoleErr))
        .await?;
    supervisor.set_stdin(tokio::io::stdin()).await?;

    info!("Connected; press Ctrl-C to disconnect");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, disconnecting...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, disconnecting...");
        }
    }

    supervisor.disconnect().await?;
    Ok(())
}

fn handle_config_command(
    config: ConsoleConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!("Connection profile is valid");
    Ok(())
}
