//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rtbh")]
#[command(author, version, about = "Aggregate IP blocklists and push them to a router as null routes")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "/etc/rtbh/config.yaml", global = true)]
    pub config: PathBuf,

    /// Quiet mode (for cron/systemd timer)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch, aggregate and render the blocklist, then deploy it to the router
    Push {
        /// Write the artifact but do not contact the router
        #[arg(long, visible_alias = "no-upload")]
        dry_run: bool,

        /// Deploy even if the artifact is unchanged since the last confirmed push
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration, exclusions and local entries
    Check,

    /// Show version
    Version,
}
