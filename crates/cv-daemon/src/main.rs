//! covey daemon: joins the group, runs task intake and delivery until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cv_core::config::{Config, LogFormat};
use cv_daemon::daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "covey", version, about = "Group coordination agent")]
struct Cli {
    /// Config file (defaults to ~/.covey/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    if cli.json_logs || config.general.log_format == LogFormat::Json {
        cv_telemetry::logging::init_logging_json("covey", &config.general.log_level);
    } else {
        cv_telemetry::logging::init_logging("covey", &config.general.log_level);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %config.group.agent_id,
        group = %config.group.group_name,
        "covey starting"
    );

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
