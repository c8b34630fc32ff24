//! CLI command handlers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::{AppSubcommand, Command, ConfigSubcommand, OutputFormat};
use crate::config::{Config, ConfigLoader, paths};
use crate::controller::{Controller, SyncRequest};
use crate::destination::{DestinationRegistry, KubeDestination, create_client};
use crate::diff::ResourceState;
use crate::models::{AppStatus, Application, SyncOperation};
use crate::registry::KindRegistry;
use crate::source::{CachedSource, GitSource, Source};
use crate::store::FileStore;

/// Build a controller against the configured cluster and state directory.
async fn build_controller(config: &Config) -> Result<Controller> {
    let registry = Arc::new(KindRegistry::builtin());

    let client = create_client(config.destination.context.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;
    let destination = Arc::new(KubeDestination::new(
        client,
        &config.destination.prune_kinds,
    ));
    let destinations =
        DestinationRegistry::new().with(config.destination.server.clone(), destination);

    let source: Arc<dyn Source> = Arc::new(CachedSource::new(
        Arc::new(GitSource::new(paths::data_dir())),
        config.cache.capacity,
        Duration::from_secs(config.cache.ttl_secs),
    ));

    let state_dir = ConfigLoader::state_dir(config);
    let store = Arc::new(FileStore::new(
        state_dir.clone(),
        config.controller.history_retention,
    ));

    tracing::debug!(state_dir = %state_dir.display(), server = %config.destination.server, "building controller");
    Controller::new(
        source,
        destinations,
        registry,
        store,
        config.controller_settings(),
    )
    .with_context(|| format!("Failed to load state from {}", state_dir.display()))
}

/// Handle every command that needs a controller
pub async fn run_command(command: Command, config: Config) -> Result<()> {
    let controller = build_controller(&config).await?;

    match command {
        Command::Run => {
            tracing::info!(
                applications = controller.applications().await.len(),
                "starting kubesync"
            );
            controller
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for interrupt");
                    }
                })
                .await?;
        }
        Command::App { subcommand } => handle_app_command(&controller, subcommand).await?,
        Command::Sync {
            name,
            dry_run,
            prune,
        } => {
            let operation = controller
                .trigger_sync(&name, SyncRequest { dry_run, prune })
                .await
                .with_context(|| format!("Failed to sync {}", name))?;
            print_operation(&operation);
        }
        Command::Diff { name } => {
            let report = controller
                .diff(&name)
                .await
                .with_context(|| format!("Failed to diff {}", name))?;
            let mut changed = 0;
            for entry in &report.resources {
                if entry.state == ResourceState::Synced {
                    continue;
                }
                changed += 1;
                println!("{:<15} {}", entry.state.to_string(), entry.key);
                if let Some(message) = &entry.message {
                    println!("    {}", message);
                }
                for path in &entry.differences {
                    println!("    ~ {}", path);
                }
            }
            if changed == 0 {
                println!("{} is in sync", name);
            }
        }
        Command::Status {
            name,
            refresh,
            output,
        } => {
            let status = if refresh {
                controller.refresh(&name).await
            } else {
                controller.status(&name).await
            }
            .with_context(|| format!("Failed to get status of {}", name))?;
            match output {
                OutputFormat::Text => print_status(&name, &status),
                OutputFormat::Yaml => print!(
                    "{}",
                    serde_yaml::to_string(&status).context("Failed to serialize status")?
                ),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("Failed to serialize status")?
                ),
            }
        }
        Command::History { name } => {
            let history = controller.history(&name).await?;
            if history.is_empty() {
                println!("No sync operations recorded for {}", name);
            }
            for op in history.iter().rev() {
                println!(
                    "{}  {:<10} {:<9} {:<12} {}",
                    op.started_at.format("%Y-%m-%d %H:%M:%S"),
                    op.phase.to_string(),
                    op.trigger.to_string(),
                    short(&op.revision),
                    op.message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Config { .. } | Command::Version => {
            anyhow::bail!("config and version commands do not use the controller")
        }
    }

    Ok(())
}

async fn handle_app_command(controller: &Controller, cmd: AppSubcommand) -> Result<()> {
    match cmd {
        AppSubcommand::Add { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let app: Application = serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse application in {}", file.display()))?;
            let name = app.name.clone();
            controller.add_application(app).await?;
            println!("Application {} added", name);
        }
        AppSubcommand::List => {
            let apps = controller.applications().await;
            if apps.is_empty() {
                println!("No applications registered");
                return Ok(());
            }
            println!(
                "{:<24} {:<10} {:<12} {:<10} {}",
                "NAME", "SYNC", "HEALTH", "AUTO", "SOURCE"
            );
            for app in apps {
                let status = controller.status(&app.name).await?;
                println!(
                    "{:<24} {:<10} {:<12} {:<10} {}@{}",
                    app.name,
                    status.sync.to_string(),
                    status.health.to_string(),
                    app.sync_policy.automated,
                    app.source.repo_url,
                    app.source.target_revision
                );
            }
        }
        AppSubcommand::Delete { name, cascade } => {
            controller
                .delete_application(&name, cascade)
                .await
                .with_context(|| format!("Failed to delete {}", name))?;
            println!("Application {} deleted", name);
        }
    }
    Ok(())
}

fn print_status(name: &str, status: &AppStatus) {
    println!("Name:      {}", name);
    println!(
        "Sync:      {} (revision {})",
        status.sync,
        status.revision.as_deref().map(short).unwrap_or("-")
    );
    println!("Health:    {}", status.health);
    println!("Phase:     {}", status.phase);
    if let Some(error) = &status.error {
        println!("Error:     {}", error);
    }
    if status.retries_exhausted > 0 {
        println!("Retries:   {}", status.retries_exhausted);
    }

    if !status.resources.is_empty() {
        println!();
        println!("{:<12} {:<40} {:<10} {}", "KIND", "NAME", "SYNC", "HEALTH");
        for resource in &status.resources {
            let key = &resource.resource;
            let name = if key.namespace.is_empty() {
                key.name.clone()
            } else {
                format!("{}/{}", key.namespace, key.name)
            };
            let prune = if resource.requires_pruning { " (prune)" } else { "" };
            println!(
                "{:<12} {:<40} {:<10} {}{}",
                key.kind,
                name,
                resource.sync.to_string(),
                resource.health,
                prune
            );
        }
    }

    if let Some(op) = &status.last_operation {
        println!();
        print_operation(op);
    }
}

fn print_operation(op: &SyncOperation) {
    println!(
        "Operation {} ({}, revision {}{}): {}",
        op.id,
        op.trigger,
        short(&op.revision),
        if op.dry_run { ", dry run" } else { "" },
        op.phase
    );
    if let Some(message) = &op.message {
        println!("  {}", message);
    }
    for action in &op.actions {
        println!(
            "  wave {:<3} {:<9} {:<8} {:<50} {:<10} attempts={}{}",
            action.wave,
            action.phase.to_string(),
            action.kind.to_string(),
            action.resource.to_string(),
            action.result.to_string(),
            action.attempts,
            action
                .message
                .as_deref()
                .map(|m| format!("  {}", m))
                .unwrap_or_default()
        );
    }
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

/// Handle configuration subcommands
pub fn handle_config_command(cmd: ConfigSubcommand) -> Result<()> {
    match cmd {
        ConfigSubcommand::Get { key } => {
            let config = ConfigLoader::load().context("Failed to load configuration")?;

            if let Some(key) = key {
                let value = crate::config::get_config_value(&config, &key)?;
                println!("{}", value);
            } else {
                let yaml =
                    serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
                print!("{}", yaml);
            }
        }
        ConfigSubcommand::Set { key, value } => {
            // Only the file layer is saved, never environment overrides
            let path = paths::root_config_path();
            let mut config = if path.exists() {
                ConfigLoader::load_file(&path)?
            } else {
                ConfigLoader::load_defaults()
            };

            crate::config::set_config_value(&mut config, &key, &value)
                .with_context(|| format!("Failed to set {} = {}", key, value))?;

            ConfigLoader::save_root(&config).context("Failed to save configuration")?;
            println!("Configuration saved");
        }
        ConfigSubcommand::List => {
            let config = ConfigLoader::load().context("Failed to load configuration")?;
            for key in crate::config::KEYS {
                println!("{} = {}", key, crate::config::get_config_value(&config, key)?);
            }
        }
        ConfigSubcommand::Path => {
            println!("{}", paths::root_config_path().display());
        }
        ConfigSubcommand::Validate => match ConfigLoader::validate() {
            Ok(_) => {
                println!("Configuration is valid");
            }
            Err(e) => {
                eprintln!("Configuration validation failed: {:#}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
