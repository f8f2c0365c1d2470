//! alertcast server
//!
//! Geofenced real-time disaster alert gateway: consumes alerts from the
//! message bus, fans them out to WebSocket clients by location channel and
//! pushes distance-annotated alerts to clients inside an alert's radius.

mod api;
mod app;
mod config;
mod server;
mod shutdown;
mod state;

use alertcast_core::bus::{AlertPublisher, MessageBus, Topic};
use alertcast_sdk::objects::AlertKind;
use anyhow::Context;
use app::App;
use clap::{Parser, Subcommand, ValueEnum};
use config::{ConfigLoader, LoadedConfig};
use serde_json::{Value, json};
use server::{build_router, run_server};
use shutdown::{shutdown_signal, spawn_config_reload_handler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// alertcast - geofenced real-time alert gateway
#[derive(Parser, Debug)]
#[command(name = "alertcast-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ALERTCAST_CONFIG", default_value = "./alertcast.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Create the bus topics and subscriptions, then exit
    SetupBus,
    /// Publish one alert to the bus, then exit
    Publish {
        /// Kind of alert; selects the topic
        #[arg(short, long, value_enum)]
        kind: KindArg,
        /// JSON file with the alert body. Without it a test alert is sent.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    EmergencyAlert,
    DisasterWarning,
    EvacuationNotice,
    SystemNotification,
}

impl From<KindArg> for AlertKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::EmergencyAlert => AlertKind::EmergencyAlert,
            KindArg::DisasterWarning => AlertKind::DisasterWarning,
            KindArg::EvacuationNotice => AlertKind::EvacuationNotice,
            KindArg::SystemNotification => AlertKind::SystemNotification,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let args = Args::parse();

    tracing::info!("Starting alertcast-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config_loader, loaded_config).await,
        Command::SetupBus => setup_bus(&loaded_config).await,
        Command::Publish { kind, file } => publish(&loaded_config, kind.into(), file).await,
    }
}

async fn serve(config_loader: Arc<ConfigLoader>, config: LoadedConfig) -> anyhow::Result<()> {
    let listen_addr = config.server.listen;
    let app = App::start(&config).await;

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(config_loader, app.matcher_config.clone());

    // Build the router
    let router = build_router(app.state.clone());

    // Run the server
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr, shutdown_signal()).await;

    // Signal the config reload handler and the components to stop
    reload_notify.notify_one();
    app.shutdown().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

async fn setup_bus(config: &LoadedConfig) -> anyhow::Result<()> {
    let bus = MessageBus::from_config(&config.bus).await;
    if bus.is_degraded() {
        anyhow::bail!("message backbone `{}` is not reachable", config.bus.backbone);
    }

    let report = bus.ensure_topology(&Topic::ALL).await;
    for (topic, result) in report.topics.iter().chain(&report.subscriptions) {
        match result {
            Ok(outcome) => tracing::info!(%topic, ?outcome, "Provisioned"),
            Err(e) => tracing::error!(%topic, error = %e, "Provisioning failed"),
        }
    }
    match report.failures() {
        0 => {
            tracing::info!("Bus topology is ready");
            Ok(())
        }
        n => anyhow::bail!("{n} bus resources could not be provisioned"),
    }
}

async fn publish(config: &LoadedConfig, kind: AlertKind, file: Option<PathBuf>) -> anyhow::Result<()> {
    let body = match file {
        Some(path) => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))?
        }
        None => test_alert(kind),
    };

    let bus = MessageBus::from_config(&config.bus).await;
    if bus.is_degraded() {
        anyhow::bail!("message backbone `{}` is not reachable", config.bus.backbone);
    }
    bus.ensure_topology(&[Topic::for_kind(kind)]).await;

    let published = AlertPublisher::new(bus).publish(kind, body).await?;
    tracing::info!(
        %kind,
        alert_id = %published.id,
        message_id = %published.message_id,
        "Alert published"
    );
    Ok(())
}

/// A recognisable test body for each kind.
fn test_alert(kind: AlertKind) -> Value {
    let location = json!({"city": "Mumbai", "state": "Maharashtra"});
    match kind {
        AlertKind::EmergencyAlert => json!({
            "title": "Test emergency alert",
            "message": "This is a test of the alert distribution system",
            "severity": "high",
            "location": location,
        }),
        AlertKind::DisasterWarning => json!({
            "title": "Test disaster warning",
            "description": "This is a test of the alert distribution system",
            "severity": "warning",
            "location": location,
        }),
        AlertKind::EvacuationNotice => json!({
            "area": {"city": "Mumbai", "state": "Maharashtra", "region": "Mumbai,Maharashtra"},
            "reason": "Test evacuation notice",
        }),
        AlertKind::SystemNotification => json!({
            "message": "Test system notification",
        }),
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,async_nats=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
