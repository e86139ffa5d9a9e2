//! Beacon Server
//!
//! Run with: cargo run --bin beacon -- --config beacon.toml
//!
//! # Configuration
//!
//! Settings come from a TOML file (`--config`, or the first of
//! `~/.config/beacon/config.toml`, `/etc/beacon/config.toml`,
//! `./beacon.toml`), then environment variables:
//! - `BEACON_HOST`, `BEACON_PORT`: Listen address (default: 0.0.0.0:8086)
//! - `BEACON_SEND_QUEUE`: Per-connection queue capacity (default: 256)
//! - `BEACON_LOG_LEVEL`, `BEACON_LOG_FORMAT`: Logging (default: info, pretty)
//! - `RUST_LOG`: Overrides the configured log level

use anyhow::Context;
use beacon::api::{serve, shutdown_signal, AppState};
use beacon::bridge::{require_flag, BridgeAdapter, MemoryBus, MessageBus};
use beacon::config::{generate_default_config, Config, LoggingConfig};
use beacon::websocket::Hub;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time WebSocket broadcast hub")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    init_logging(&config.logging);

    tracing::info!("Starting Beacon v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        send_queue = config.hub.send_queue_capacity,
        ping_interval_secs = config.keepalive.ping_interval_secs,
        pong_timeout_secs = config.keepalive.pong_timeout_secs,
        "Hub configured"
    );

    let cancel = CancellationToken::new();
    let (hub, coordinator) = Hub::spawn(config.hub_config(), cancel.clone());

    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let mut state = AppState::new(hub.clone(), Arc::clone(&bus));

    let bridge = if config.bridge.enabled {
        let filter = config.bridge.required_flag.clone().map(require_flag);
        let bridge = Arc::new(
            BridgeAdapter::connect(bus.as_ref(), hub, filter)
                .await
                .context("connecting bridge to message bus")?,
        );
        state = state.with_bridge(Arc::clone(&bridge));
        Some(bridge)
    } else {
        tracing::info!("Bridge disabled");
        None
    };

    let signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let served = serve(state, &config.server, cancel.clone()).await;

    // Also reached when the listener fails to bind
    cancel.cancel();
    if let Some(bridge) = bridge {
        if let Err(e) = bridge.close().await {
            tracing::warn!("Failed to close bridge: {}", e);
        }
    }
    if let Err(e) = coordinator.await {
        tracing::error!("Hub coordinator failed: {}", e);
    }

    served?;
    tracing::info!("Beacon shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("beacon={0},tower_http={0}", config.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
