//! rivven-bridge - AMQP and HTTP bridge for Rivven
//!
//! # Usage
//!
//! ```bash
//! # Start the bridge
//! rivven-bridge -c bridge.yaml
//!
//! # Validate configuration
//! rivven-bridge -c bridge.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rivven_bridge::config::{BridgeConfig, BrokerBackend};
use rivven_bridge::{broker, HttpBridge};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-bridge")]
#[command(version, about = "AMQP 1.0 and HTTP bridge for Rivven streaming platform")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "bridge.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = BridgeConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: BridgeConfig) -> Result<()> {
    info!("Starting rivven-bridge");
    info!("Broker backend: {:?}", config.broker.backend);
    if config.broker.backend == BrokerBackend::Memory {
        warn!("Memory backend keeps records in process; they are lost on exit");
    }

    let broker = broker::connect(&config.broker)
        .await
        .context("Failed to connect to broker")?;

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid HTTP listen address {}:{}",
                config.http.host, config.http.port
            )
        })?;

    HttpBridge::new(&config, broker)
        .run(addr, shutdown_signal())
        .await?;

    info!("rivven-bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

fn validate_config(config: &BridgeConfig) -> Result<()> {
    config.validate()?;

    println!("✓ Configuration is valid");
    println!();
    println!("Broker:");
    println!("  Backend: {:?}", config.broker.backend);
    if config.broker.backend == BrokerBackend::Kafka {
        println!("  Bootstrap servers: {:?}", config.broker.bootstrap_servers);
    }
    println!();
    println!("AMQP:");
    println!("  Flow credit: {}", config.amqp.flow_credit);
    println!("  Credit increment: {}", config.amqp.credit_increment);
    println!("  Message converter: {:?}", config.amqp.message_converter);
    println!();
    println!("HTTP:");
    println!("  Listen: {}:{}", config.http.host, config.http.port);
    println!("  Format: {:?}", config.http.format);
    println!("  Max in-flight sends: {}", config.http.max_in_flight_sends);

    Ok(())
}
