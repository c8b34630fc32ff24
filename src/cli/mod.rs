//! CLI command handling module
//!
//! Argument definitions and the handlers behind each subcommand.

mod commands;
mod logging;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

pub use commands::{handle_config_command, run_command};
pub use logging::init_logging;
pub use version::display_version;

/// kubesync - converge Kubernetes clusters to manifests in Git
#[derive(Parser, Debug)]
#[command(name = "kubesync")]
#[command(about = "A GitOps reconciliation engine: converge Kubernetes clusters to manifests in Git", long_about = None)]
pub struct Args {
    /// Enable debug logging to a temporary file
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Main commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reconciliation loop until interrupted
    Run,
    /// Manage applications
    App {
        #[command(subcommand)]
        subcommand: AppSubcommand,
    },
    /// Sync an application now
    Sync {
        name: String,
        /// Plan and report without changing the cluster
        #[arg(long)]
        dry_run: bool,
        /// Delete resources no longer in the source, even if the policy does not prune
        #[arg(long)]
        prune: bool,
    },
    /// Show differences between desired and live state
    Diff { name: String },
    /// Show application status
    Status {
        name: String,
        /// Run a reconciliation pass first
        #[arg(long)]
        refresh: bool,
        #[arg(long, short = 'o', value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Show recent sync operations
    History { name: String },
    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
    /// Show version information
    Version,
}

/// Application management subcommands
#[derive(Subcommand, Debug)]
pub enum AppSubcommand {
    /// Register an application from a YAML file
    Add {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// List registered applications
    List,
    /// Remove an application
    Delete {
        name: String,
        /// Also delete the live resources it manages
        #[arg(long)]
        cascade: bool,
    },
}

/// Configuration management subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Get configuration value
    Get {
        /// Configuration key (e.g., "controller.pollIntervalSecs")
        key: Option<String>,
    },
    /// Set configuration value
    Set {
        /// Configuration key (e.g., "destination.context")
        key: String,
        /// Configuration value
        value: String,
    },
    /// List all configuration
    List,
    /// Show configuration file path
    Path,
    /// Validate configuration
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Yaml,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_sync_flags() {
        let args = Args::try_parse_from(["kubesync", "sync", "guestbook", "--dry-run", "--prune"])
            .unwrap();
        match args.command {
            Command::Sync {
                name,
                dry_run,
                prune,
            } => {
                assert_eq!(name, "guestbook");
                assert!(dry_run);
                assert!(prune);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_app_delete_and_global_debug() {
        let args =
            Args::try_parse_from(["kubesync", "app", "delete", "guestbook", "--cascade", "-d"])
                .unwrap();
        assert!(args.debug);
        assert!(matches!(
            args.command,
            Command::App {
                subcommand: AppSubcommand::Delete { cascade: true, .. }
            }
        ));
    }
}
