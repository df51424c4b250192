//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Overseer CLI
#[derive(Parser)]
#[command(name = "overseer-cli")]
#[command(about = "Agent orchestration core: plan, route, gate, execute, audit")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an orchestration job from a configuration file
    Run {
        /// Path to the job configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the audit history recorded for one trace
    History {
        /// Trace id to look up
        trace_id: String,

        /// Maximum number of records to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}
