//! # rtbh - RTBH blocklist aggregator and router deployer
//!
//! Collects public and local IP blocklists, merges them into a minimal set
//! of CIDR blocks, removes trusted networks, renders the result as null
//! route directives and pushes it to a router over SSH.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          rtbh                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: push [--dry-run] [--force], check, version │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── sources, exclusions, local entries, router, render   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Fetcher (reqwest + rustls)                                 │
//! │    └── HTTPS sources, local list files, .myset entries      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Aggregator + Exclusions (NetworkSet interval algebra)      │
//! │    └── union, CIDR-exact subtraction, per address family    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Render                                                     │
//! │    └── clear line, one route per block, end; sha256 id      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Deployer (DeviceTransport trait)                           │
//! │    ├── OpenSshTransport (scp/ssh, sshpass)                  │
//! │    └── upload → verify → snapshot/apply → confirm/rollback  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use rtbh::config::Config;
//! use rtbh::fetcher::Fetcher;
//! use rtbh::pipeline::{prepare, RunSummary};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/rtbh/config.yaml")?;
//!     config.validate()?;
//!
//!     let fetcher = Fetcher::new()?;
//!     let mut summary = RunSummary::default();
//!     let prepared = prepare(&config, &fetcher, &mut summary).await?;
//!     print!("{}", prepared.artifact.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`netset`] - Normalized CIDR sets with union and subtraction
//! - [`aggregator`] - Source parsing and merging
//! - [`exclusion`] - Trusted-network removal
//! - [`render`] - Route directives and the deployable artifact
//! - [`deployer`] - Upload, apply, confirm and rollback state machine
//! - [`fetcher`] - HTTPS and local source retrieval
//! - [`pipeline`] - End-to-end run and its summary
//! - [`config`] - Configuration parsing and validation
//! - [`lock`] - Per-device deployment lock
//! - [`state`] - Last confirmed deployment record
//! - [`cmd_abstraction`] - Mockable process execution
//! - [`cli`] / [`commands`] - Command-line interface
//! - [`error`] - Error taxonomy and exit codes
//! - [`utils`] - Formatting helpers

pub mod aggregator;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod deployer;
pub mod error;
pub mod exclusion;
pub mod fetcher;
pub mod lock;
pub mod netset;
pub mod pipeline;
pub mod render;
pub mod state;
pub mod utils;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::RtbhError;
