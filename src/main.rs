//! Telemetry pipeline server.
//!
//! # Architecture Overview
//!
//! ```text
//!   Browser / client SDK                     ┌──────────────────────────────────────────┐
//!   ┌──────────────────────┐                 │            TELEMETRY PIPELINE            │
//!   │ TelemetryCollector   │  POST batch     │                                          │
//!   │  metrics / errors /  │────────────────▶│  correlation ──▶ ingest ──▶ ContextLogger│
//!   │  page views / inter. │ X-Correlation-Id│      │                                   │
//!   └──────────────────────┘                 │      ▼                                   │
//!   ┌──────────────────────┐                 │  track_requests ──▶ MetricsAggregator    │
//!   │ InstrumentedClient   │── any request ─▶│                          │               │
//!   └──────────────────────┘                 │                          ▼               │
//!                                            │               GET /metrics, /api/metrics │
//!                                            └──────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use telemetry_pipeline::config::{load_config, watcher::ConfigWatcher, PipelineConfig};
use telemetry_pipeline::lifecycle::{wait_for_signal, Shutdown};
use telemetry_pipeline::observability::{logging, metrics};
use telemetry_pipeline::HttpServer;

#[derive(Parser)]
#[command(name = "telemetry-pipeline", version, about = "Telemetry ingestion and correlation server")]
struct Args {
    /// Path to a TOML config file; defaults are used when omitted
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PipelineConfig::default(),
    };

    logging::init_logging(&config.logging)?;

    tracing::info!(
        service = %config.service.name,
        version = %config.service.version,
        environment = %config.service.environment,
        "telemetry-pipeline starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        interaction_sample_rate = config.ingestion.interaction_sample_rate,
        "Configuration loaded"
    );

    if config.metrics.prometheus_enabled {
        metrics::init_metrics();
    }

    // The watcher handle must outlive the server for reloads to keep flowing.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (Some(handle), rx),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    (None, rx)
                }
            }
        }
        None => (None, mpsc::unbounded_channel().1),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    let server = HttpServer::new(config);
    let shutdown_rx = shutdown.subscribe();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    server.run(listener, config_updates, shutdown_rx).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
