use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use overseer_core::config::{OverseerConfig, DEFAULT_CONFIG_PATH};
use tracing::{info, warn};

mod builder;
mod signals;

/// overseer - runs shell and container jobs on cron schedules
#[derive(Parser)]
#[command(name = "overseer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and run until SIGINT/SIGTERM
    Daemon {
        /// Config file
        #[arg(short, long, env = "OVERSEER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Load the config, build every job and print them without running anything
    Validate {
        /// Config file
        #[arg(short, long, env = "OVERSEER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=info".into()),
        )
        .init();

    match Cli::parse().command {
        Commands::Daemon { config } => daemon(&config).await,
        Commands::Validate { config } => validate(&config),
    }
}

fn load(path: &std::path::Path) -> anyhow::Result<OverseerConfig> {
    let path = path.to_string_lossy();
    OverseerConfig::load(Some(&*path)).with_context(|| format!("loading {path}"))
}

async fn daemon(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let scheduler = builder::build_scheduler(&config)?;

    scheduler.start().await.context("starting scheduler")?;
    info!(jobs = config.job_count(), "overseer running");

    let signal = signals::wait_for_shutdown().await?;
    info!(signal, "Signal received, stopping scheduler");

    if scheduler.is_running() {
        warn!("Waiting running jobs.");
        scheduler.stop().await?;
    }
    Ok(())
}

fn validate(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let scheduler = builder::build_scheduler(&config)?;

    let jobs = scheduler.jobs();
    for job in &jobs {
        println!("{}\t{}\t{}", job.name(), job.schedule(), job.command());
    }
    info!(jobs = jobs.len(), "config is valid");
    Ok(())
}
