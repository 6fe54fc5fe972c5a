//! nest-dispatch - Main Entry Point
//!
//! `run` keeps a supervised broker connection and the health endpoints up
//! until SIGINT/SIGTERM. `send` dispatches a single command and prints the
//! outcome as JSON.

use clap::{Parser, Subcommand};
use nest_dispatch::config::DispatchConfig;
use nest_dispatch::dispatch::{ConfirmationCoordinator, StateDispatcher};
use nest_dispatch::observability::{init_default_logging, init_logging, HealthServer, LogFormat};
use nest_dispatch::supervisor::ConnectionSupervisor;
use nest_dispatch::transport::mqtt::{MqttClient, ReconnectConfig};
use nest_dispatch::transport::Transport;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

/// Command dispatch for MQTT-connected robots
#[derive(Parser)]
#[command(name = "nest-dispatch")]
#[command(about = "Send commands to robot agents over MQTT and confirm their state")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "NEST_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, supervise the connection and serve health endpoints
    Run,
    /// Dispatch one command and wait for the device's state
    Send {
        /// Target agent id
        #[arg(short, long)]
        agent: String,
        /// Command verb, e.g. `on` or `off`
        #[arg(long = "command")]
        verb: String,
        /// Confirmation timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["dispatch.toml", "config/dispatch.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!("Starting nest-dispatch v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Send {
            agent,
            verb,
            timeout_ms,
        } => send_once(config, &agent, &verb, timeout_ms).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    if verbose == 0 {
        init_default_logging();
        return;
    }

    let level = if verbose == 1 {
        Level::DEBUG
    } else {
        Level::TRACE
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    init_logging(level, format, false);
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<DispatchConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DispatchConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DispatchConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using defaults");
    Ok(DispatchConfig::default())
}

/// Wire the transport to the inbound dispatcher
fn build_transport(
    config: &DispatchConfig,
) -> Result<(Arc<MqttClient>, Arc<StateDispatcher>), Box<dyn std::error::Error>> {
    let credentials = config.resolve_credentials()?;
    let dispatcher = Arc::new(StateDispatcher::new());
    let client = Arc::new(MqttClient::new(
        config.mqtt.clone(),
        credentials,
        dispatcher.clone(),
    ));
    Ok((client, dispatcher))
}

async fn run_service(config: DispatchConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (client, _dispatcher) = build_transport(&config)?;
    info!("Using MQTT client id {}", client.client_id());

    let transport: Arc<dyn Transport> = client.clone();

    let health_server = Arc::new(HealthServer::new(
        client.client_id().to_string(),
        config.health.port,
        transport.clone(),
    ));
    tokio::spawn(health_server.start());

    // A broker that is down at startup is not fatal; the supervisor retries
    if let Err(e) = client.connect().await {
        warn!("Initial broker connection failed: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(
        transport.clone(),
        ReconnectConfig::from(&config.reconnect),
        config.dispatch.poll_interval(),
    );
    let mut supervisor_handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Dispatcher is running");

    let mut outcome: Result<(), Box<dyn std::error::Error>> = Ok(());
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        result = &mut supervisor_handle => {
            error!("Connection supervisor stopped, shutting down");
            outcome = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = client.disconnect().await {
        warn!("Error during disconnect: {}", e);
    }

    outcome
}

async fn send_once(
    config: DispatchConfig,
    agent_id: &str,
    verb: &str,
    timeout_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (client, dispatcher) = build_transport(&config)?;
    let target = client.connect().await?;
    info!("Connected to {}", target);

    let coordinator = ConfirmationCoordinator::new(client.clone(), dispatcher, &config.dispatch);
    let result = coordinator
        .dispatch_command(agent_id, verb, timeout_ms)
        .await;

    if let Err(e) = client.disconnect().await {
        warn!("Error during disconnect: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

fn handle_config_command(
    config: &DispatchConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
