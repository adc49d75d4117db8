//! Push command implementation.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info};

use crate::config::Config;
use crate::deployer::OpenSshTransport;
use crate::fetcher::Fetcher;
use crate::pipeline::{failure_exit_code, push, PushOptions, RunSummary};

/// Run the push command and return the process exit code.
///
/// The run summary is printed whatever the outcome. Only errors raised
/// before the pipeline starts (config loading) are returned as `Err`.
pub async fn run(config_path: &Path, options: PushOptions) -> Result<i32> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.validate()?;
    if !options.dry_run {
        config.router.validate()?;
    }

    info!("Building black-hole route set...");
    let fetcher = Fetcher::new()?;
    let transport = OpenSshTransport::new(&config.router);

    let mut summary = RunSummary::default();
    let result = push(&config, options, &fetcher, transport, &mut summary).await;

    println!();
    println!("{}", summary);
    println!();

    match result {
        Ok(code) => Ok(code),
        Err(e) => {
            error!("{:#}", e);
            Ok(failure_exit_code(&summary, &e))
        }
    }
}
