//! RLC Loopback Simulator
//!
//! Runs two RLC stacks against each other over a lossy channel and prints
//! the per-bearer counters as JSON.

mod config;
mod link;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::SimConfig;

/// RLC loopback simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML or TOML configuration file; built-in defaults when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the channel loss rate
    #[arg(long)]
    loss_rate: Option<f64>,

    /// Override the loss pattern seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write the JSON report to this file instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting RLC loopback simulator");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration file: {}", path.display());
            SimConfig::from_file(path)?
        }
        None => SimConfig::default(),
    };
    if let Some(loss_rate) = args.loss_rate {
        config.channel.loss_rate = loss_rate;
    }
    if let Some(seed) = args.seed {
        config.channel.seed = seed;
    }
    config.validate()?;

    info!("Channel: loss rate {}, TTI {} ms, grant {} bytes, seed {}",
          config.channel.loss_rate, config.channel.tti_ms, config.channel.grant_bytes, config.channel.seed);
    for bearer in &config.bearers {
        info!("  {}: {} mode", bearer.lcid()?, bearer.rlc.mode);
    }

    let report = tokio::select! {
        report = link::run(&config) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, no report written");
            return Ok(());
        }
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => {
            std::fs::write(path, json)?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }

    info!("Simulation complete");
    Ok(())
}
