//! Alert controller - Main Entry Point
//!
//! Loads the controller configuration, connects to the device broker and
//! keeps the alert level and the venue devices in sync until shut down.

use alert_control::config::ControlConfig;
use alert_control::observability::{
    init_default_logging, init_logging, metrics, HealthServer, LogFormat,
};
use alert_control::router::ping_all;
use alert_control::service::ControlService;
use alert_control::transport::mqtt::MqttClient;
use alert_control::transport::Transport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, Level};

/// Alert level controller for live game installations
#[derive(Parser)]
#[command(name = "alert-control")]
#[command(about = "Alert level state engine and device message router")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ALERT_CONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Ping every device type once and exit
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        init_logging(Level::DEBUG, LogFormat::Pretty, cli.verbose > 1);
    } else {
        init_default_logging();
    }

    info!("Starting alert controller v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_controller(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Ping => ping_devices(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ControlConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ControlConfig::load_from_file(path)?);
    }

    for path_str in ["alert-control.toml", "config/alert-control.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ControlConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create alert-control.toml".into())
}

async fn run_controller(config: ControlConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Controller starting with service ID: {}", config.service.id);
    let collector = metrics();

    let transport = MqttClient::new(&config.service.id, config.mqtt.clone()).await?;
    let mut service = ControlService::new(config.clone(), transport)?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(config.service.id.clone(), health_port));
    tokio::spawn(health_server.clone().start());
    service.set_health_server(health_server.clone());

    service.initialize().await?;
    service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Controller is running and routing device traffic");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&service) => {
            error!("MQTT connection permanently lost, shutting down controller...");
        }
    }

    if let Err(e) = service.shutdown().await {
        error!("Error during shutdown: {}", e);
        collector.set_service_state("error");
        return Err(e.into());
    }
    Ok(())
}

async fn ping_devices(config: ControlConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = MqttClient::new(&config.service.id, config.mqtt).await?;
    client.connect().await?;

    let result = ping_all(&client).await;
    if let Err(e) = client.disconnect().await {
        error!("Error disconnecting after ping: {}", e);
    }

    let sent = result?;
    println!("Pinged {sent} device types");
    Ok(())
}

fn handle_config_command(
    config: ControlConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(
        states = config.states.len(),
        devices = config.devices.len(),
        "Configuration validation complete"
    );
    Ok(())
}

/// Keep the health server in step with the link and return once it is gone for good
async fn monitor_connection_health<T>(service: &ControlService<T>)
where
    T: Transport + 'static,
{
    loop {
        if service.is_permanently_disconnected() {
            break;
        }
        service.refresh_health();
        sleep(Duration::from_millis(100)).await;
    }
}
