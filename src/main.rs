//! kubesync - a GitOps reconciliation engine
//!
//! Keeps Kubernetes clusters converged to manifests stored in Git.

use anyhow::{Context, Result};
use clap::Parser;

use kubesync::cli::{self, Args, Command};
use kubesync::config::ConfigLoader;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config and version commands work without a cluster or logging
    let command = match args.command {
        Command::Config { subcommand } => return cli::handle_config_command(subcommand),
        Command::Version => {
            cli::display_version();
            return Ok(());
        }
        command => command,
    };

    let config = ConfigLoader::load().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let log_file = cli::init_logging(args.debug, &config.log_level)?;
    if let Some(ref log_path) = log_file {
        eprintln!(
            "Debug logging enabled. Logs written to: {}",
            log_path.display()
        );
    }
    tracing::debug!(?command, "configuration loaded");

    cli::run_command(command, config).await
}
