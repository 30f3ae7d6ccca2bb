//! CLI entry point for the conditioning rig.
//!
//! Runs one full animal session against simulated hardware: brings the
//! device chain online, configures the animal, executes the trial loop,
//! and shuts everything down. The GUI front end is intentionally absent;
//! this binary exists for bench testing and headless dry runs.
//!
//! # Usage
//!
//! ```bash
//! cond_rig --animal rat1 --trial-type condition
//! cond_rig --config rig.toml --animal rat2 --trial-type control
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::error;

use cond_rig::config::Settings;
use cond_rig::core::NullDisplay;
use cond_rig::experiment::ExperimentEngine;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "cond_rig")]
#[command(about = "Behavioral-conditioning rig controller (simulated hardware)", long_about = None)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Animal identifier for this run
    #[arg(long)]
    animal: String,

    /// Trial type to run (must exist in the configured trial options)
    #[arg(long, default_value = "control")]
    trial_type: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let mut engine = ExperimentEngine::new(settings, Arc::new(NullDisplay));
    engine.bring_up().await?;
    engine.configure_animal(&cli.animal, &cli.trial_type).await?;

    let run = engine.run_animal().await;
    if let Err(err) = &run {
        error!(%err, "run aborted");
    }
    let shutdown = engine.shut_down().await;

    run?;
    shutdown?;
    Ok(())
}
