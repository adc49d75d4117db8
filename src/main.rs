//! rtbh - RTBH blocklist aggregator and router deployer
//!
//! Exit codes: 0 success, 1 pipeline failure, 2 deployment failed or
//! rolled back, 3 no changes to apply.

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use rtbh::cli::{Cli, Commands};
use rtbh::error::{exit_code_for, EXIT_OK};
use rtbh::pipeline::PushOptions;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let result = match cli.command {
        Commands::Push { dry_run, force } => {
            rtbh::commands::push::run(&cli.config, PushOptions { dry_run, force }).await
        }
        Commands::Check => rtbh::commands::check::run(&cli.config).await.map(|_| EXIT_OK),
        Commands::Version => {
            println!("rtbh {}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_OK)
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
