//! # cartwire
//!
//! Server binary: loads settings, initializes logging and metrics, and
//! serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use cartwire_core::logging::init_subscriber;
use cartwire_server::CartwireServer;
use cartwire_settings::{CartwireSettings, load_settings_from_path, settings_path};
use clap::Parser;

/// cartwire real-time server.
#[derive(Parser, Debug)]
#[command(name = "cartwire", about = "Real-time cart, inventory and notification server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.cartwire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or `EnvFilter` directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(settings_path)
    }

    fn apply(&self, settings: &mut CartwireSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_path();
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = cartwire_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = CartwireServer::new(settings).with_metrics(metrics);
    let mut handles = server.start_background_tasks();

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("cartwire listening on http://{addr} (ws://{addr}/ws)");
    handles.push(handle);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.shutdown().graceful_shutdown(handles, None).await;
    tracing::info!(aborted = report.aborted, "Shutdown complete");
    Ok(())
}
