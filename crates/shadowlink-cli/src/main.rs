//! Command-line interface for the shadowlink bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use shadowlink_bridge::{Bridge, JsonLinesSink, MqttTransport, StateRecorder};
use shadowlink_core::BridgeConfig;
use shadowlink_devices::{DeviceRegistry, build_device};

/// Shadowlink - bridge local devices to a cloud device shadow over MQTT.
#[derive(Parser, Debug)]
#[command(name = "shadowlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to $SHADOWLINK_CONFIG, then ~/.shadowlink/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until Ctrl-C.
    Run,

    /// Load and validate the configuration.
    CheckConfig,

    /// List configured devices and their actions.
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run => run_bridge(args.config.as_deref()).await,
        Command::CheckConfig => check_config(args.config.as_deref()),
        Command::Devices => list_devices(args.config.as_deref()).await,
    }
}

fn init_logging(verbose: bool) {
    // JSON format for production/container environments
    let json_logging = std::env::var("SHADOWLINK_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "shadowlink=debug" } else { "shadowlink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_level)
                .add_directive(tracing::Level::WARN.into())
        });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    BridgeConfig::load(path).context("Failed to load bridge configuration")
}

async fn build_registry(config: &BridgeConfig) -> Result<Arc<DeviceRegistry>> {
    let registry = Arc::new(DeviceRegistry::new());
    for spec in &config.devices {
        let device = build_device(spec).await;
        registry
            .register(device)
            .await
            .with_context(|| format!("Failed to register device {}", spec.id))?;
    }
    Ok(registry)
}

async fn run_bridge(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = build_registry(&config).await?;
    if registry.is_empty().await {
        warn!("No devices configured; the bridge will answer every command with an error");
    }

    let recorder = match &config.event_log {
        Some(path) => {
            info!("Recording state changes to {}", path.display());
            StateRecorder::new(Arc::new(JsonLinesSink::new(path)))
        }
        None => StateRecorder::disabled(),
    };

    let transport =
        Arc::new(MqttTransport::from_config(&config).context("Failed to set up MQTT transport")?);
    let bridge = Arc::new(Bridge::new(&config, registry, transport, recorder));
    let handle = bridge.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");

    handle.shutdown().await?;
    Ok(())
}

fn check_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let layout = config.topic_layout();

    println!("Configuration OK");
    println!("  Endpoint:   {}:{}", config.endpoint, config.broker_port());
    println!("  Thing:      {}", config.thing_name);
    println!("  Client ID:  {}", config.client_id());
    println!("  TLS:        {}", if config.tls.is_some() { "mutual" } else { "off" });
    println!("  Commands:   {}", layout.command_filter());
    println!("  Shadow:     {}", layout.shadow_update_topic());
    println!("  Devices:    {}", config.devices.len());
    if let Some(path) = &config.event_log {
        println!("  Event log:  {}", path.display());
    }
    Ok(())
}

async fn list_devices(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    if config.devices.is_empty() {
        println!("No devices configured.");
        return Ok(());
    }

    for spec in &config.devices {
        let device = build_device(spec).await;
        println!("{} ({})", spec.id, spec.kind);
        println!("  Actions: {}", device.supported_actions().join(", "));
        println!(
            "  State:   {}",
            serde_json::to_string(&device.shadow_state())?
        );
    }
    Ok(())
}
