//! autoscalerd: the autoscaler signal pipeline daemon.
//!
//! Single binary that assembles the pipeline:
//! - State store (shared SQL database, or a node-local redb file)
//! - AppManager (policy sharding, per-app metric cache)
//! - Aggregator + metric poller pool
//! - Evaluation manager + evaluator pool
//! - Distributed lock maintainer and metric pruner
//!
//! # Usage
//!
//! ```text
//! autoscalerd run --config /etc/autoscaler/pipeline.toml
//! autoscalerd check-config --config /etc/autoscaler/pipeline.toml
//! ```

mod pipeline;
mod pruner;

use std::path::{Path, PathBuf};

use autoscaler_core::PipelineConfig;
use autoscaler_core::config::LoggingConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "autoscalerd", about = "Autoscaler signal pipeline daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline until Ctrl-C.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Load and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            init_tracing(&config.logging)?;
            run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            println!(
                "config ok: node {}/{}, metrics source {}, scaling engine {}",
                config.pool.node_index,
                config.pool.node_count,
                config.metrics_source.url,
                config.scaling_engine.url
            );
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let config = PipelineConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    info!("autoscaler pipeline starting");
    let pipeline = Pipeline::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    pipeline.stop().await;
    info!("autoscaler pipeline stopped");
    Ok(())
}
