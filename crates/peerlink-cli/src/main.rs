//! peerlink - command line entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlink_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::{CliAppConfig, CliOverrides},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration before logging so the file can set the filter
    let config = CliAppConfig::load(&CliOverrides::from(&cli))
        .context("failed to load configuration")?;

    setup_logging(config.cli.verbose, &config.cli.log_filter);
    info!("Using service id {:?}", config.session.service_id);

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;
    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured filter, raised to debug by `--verbose`
fn setup_logging(verbose: bool, configured: &str) {
    let fallback = if verbose { "debug" } else { configured };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
