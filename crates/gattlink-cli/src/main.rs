//! gattlink CLI entry point

use clap::Parser;
use tracing::{error, info};

use gattlink_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::{AppConfig, CliOverrides},
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli)?;

    if let Err(e) = CommandDispatcher::execute(cli, config).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load layered configuration with command line overrides on top
fn load_configuration(cli: &Cli) -> Result<AppConfig> {
    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path);
    }

    let overrides = CliOverrides {
        address: cli.address.clone(),
        name: cli.name.clone(),
        profile: cli.profile.clone(),
    };
    AppConfig::load(cli.config.as_deref(), &overrides)
}
