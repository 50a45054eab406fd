//! Tether daemon
//!
//! Bridges a management endpoint to cluster-private subnets over a
//! mutually authenticated TLS tunnel. Runs as either the management-side
//! server or a cluster-side client, selected by the configuration file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tether_core::{Config, Engine};

/// Tether - point-to-multipoint IP tunnel
#[derive(Parser)]
#[command(name = "tetherd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    config.validate().context("Invalid configuration")?;

    let engine = Engine::new(config);

    tokio::select! {
        result = engine.run() => {
            result.context("Tunnel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            engine.stop();
        }
    }

    Ok(())
}
