//! Main entry point for the Overseer CLI.

use anyhow::Result;
use clap::Parser;
use overseer::{cli, job, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load()?;
    telemetry::init(&settings.logging)?;

    match args.command {
        cli::Commands::Run { config } => job::run(config, settings).await,
        cli::Commands::History { trace_id, limit } => {
            job::history(&trace_id, limit, settings).await
        }
    }
}
