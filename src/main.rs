//! CLI Entry Point for rig_daq
//!
//! # Usage
//!
//! Check a script and print the estimated duration:
//! ```bash
//! rig_daq check scripts/cooldown.txt
//! ```
//!
//! Run a script, keep sampling afterwards until Ctrl+C:
//! ```bash
//! rig_daq run scripts/cooldown.txt --config config/rig.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rig_daq::config::{RigConfig, DEFAULT_CONFIG_PATH};
use rig_daq::logging;
use rig_daq::Session;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rig_daq")]
#[command(about = "Scripted experiment control and data acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a script and estimate how long it takes
    Check {
        /// Path to the script file
        script: PathBuf,

        /// Rig configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate, then execute a script against the rig
    Run {
        /// Path to the script file
        script: PathBuf,

        /// Rig configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { script, config } => {
            let (session, text) = open(&config, &script).await?;
            session.check(&text).await?;
            Ok(())
        }
        Commands::Run { script, config } => {
            let (session, text) = open(&config, &script).await?;
            run(&session, &text).await
        }
    }
}

async fn open(config_path: &Path, script_path: &Path) -> Result<(Session, String)> {
    let config = RigConfig::load_from(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %config_path.display(), "Application started");

    let text = tokio::fs::read_to_string(script_path)
        .await
        .with_context(|| format!("reading script {}", script_path.display()))?;
    let session = Session::open(&config).await?;
    Ok((session, text))
}

async fn run(session: &Session, text: &str) -> Result<()> {
    session.start(text).await?;

    tokio::select! {
        finished = session.wait_program() => {
            if let Err(e) = finished {
                error!(error = %e, "Program failed");
            }
            let status = session.monitor().status();
            if status.message == rig_daq::monitor::RUNNING {
                info!("Program finished, acquisition keeps running. Press Ctrl+C to stop");
                tokio::signal::ctrl_c().await?;
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted");
        }
    }

    session.stop().await;
    info!("Application finished");
    Ok(())
}
