//! Check command implementation.

use anyhow::{Context, Result};
use std::path::Path;

use crate::aggregator::aggregate;
use crate::config::Config;
use crate::exclusion::ExclusionSet;
use crate::fetcher::load_local_entries;

/// Validate the configuration and the local inputs without fetching
/// anything or contacting the router.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.validate()?;

    let exclusions = ExclusionSet::load(&config)?;
    let local_files = load_local_entries(&config.local_dir, &config.local_suffix)?;
    let inline = config.local_entry_blocks()?;
    let local = aggregate(&local_files, &inline)?;

    let enabled = config.enabled_sources();
    let disabled = config.sources.len() - enabled.len();

    println!();
    println!("Configuration {:?} is valid", config_path);
    println!(
        " Sources:       {} enabled, {} disabled",
        enabled.len(),
        disabled
    );
    for source in &enabled {
        let location = match (&source.url, &source.path) {
            (Some(url), _) => url.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        };
        println!("   {:<20} {}", source.name, location);
    }
    println!(" Exclusions:    {} blocks", exclusions.len());
    println!(
        " Local entries: {} files, {} inline, {} blocks ({} unparsable lines)",
        local_files.len(),
        inline.len(),
        local.set.len(),
        local.parse_errors.len()
    );
    if config.router.host.is_empty() {
        println!(" Router:        not configured (dry runs only)");
    } else {
        match config.router.validate() {
            Ok(()) => println!(
                " Router:        {} ({:?}, port {})",
                config.router.destination(),
                config.router.profile,
                config.router.port
            ),
            Err(e) => println!(" Router:        {}", e),
        }
    }
    println!();

    Ok(())
}
