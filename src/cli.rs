//! Command-line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gloom", version, about = "Mirror a read-only media tree into a normalized gallery archive tree")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON). Defaults to the per-user
    /// configuration directory.
    #[arg(short, long, global = true, env = "GLOOM_CONFIG")]
    pub config: Option<PathBuf>,
    /// Log at debug level, whatever the configuration says.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show what a run would do, without writing anything.
    Plan {
        /// List skipped items too.
        #[arg(short, long)]
        all: bool,
    },
    /// Plan and execute.
    Run {
        /// Rewrite gallery outputs even when their source is unchanged.
        #[arg(short, long)]
        force: bool,
    },
    /// Compare the sources with what was materialized before.
    Diff,
    /// Run once, then keep running on an interval and on source changes.
    Watch,
}
