//! # tagbridge
//!
//! Gateway binary: loads settings, connects the broker, and serves device
//! WebSockets until interrupted.

#![deny(unsafe_code)]

mod broker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tagbridge_server::GatewayServer;
use tagbridge_server::shutdown::StopOutcome;
use tagbridge_settings::{GatewaySettings, LoggingSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Device WebSocket to message bus gateway.
#[derive(Parser, Debug)]
#[command(name = "tagbridge", about = "Device WebSocket to message bus gateway")]
struct Cli {
    /// Settings file (JSON). Falls back to `$TAGBRIDGE_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

fn init_logging(logging: &LoggingSettings) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(logging.default_filter())),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = tagbridge_settings::load_settings(args.config.as_deref())
        .context("Failed to load settings")?;
    args.apply(&mut settings);

    init_logging(&settings.logging);

    let metrics = match tagbridge_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    let queue = broker::connect_queue(&settings.broker)
        .await
        .context("Failed to connect to message broker")?;

    let mut server = GatewayServer::new(settings.server.clone(), queue);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(
        "tagbridge listening on ws://{addr}{}?deviceTag=<tag>",
        settings.server.endpoint
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    match server.shutdown().run(handle, None).await {
        StopOutcome::Drained => info!("Shutdown complete"),
        StopOutcome::TimedOut => warn!("Shutdown complete, some sessions were cut off"),
    }
    Ok(())
}
