use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tasksync::config::SyncCoreConfig;
use tasksync::queue::{FileQueueStore, QueueStore};
use tasksync::{allowed_transitions, init_telemetry, shutdown_telemetry, Role, TaskStatus};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Inspect the client-side sync core: transition rules, queued telemetry, configuration")]
struct Cli {
    /// Configuration file layered over tasksync.toml and the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the task status transition table
    Transitions {
        /// Only show moves this role may request
        #[arg(long, help = "Role to filter by: admin, manager, member")]
        role: Option<Role>,
        /// Only show moves out of this status
        #[arg(long, help = "Source status, e.g. submitted_for_review")]
        from: Option<TaskStatus>,
    },
    /// Inspect or empty the durable telemetry queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List events waiting to be flushed
    Inspect {
        /// Queue file; defaults to queue.path from configuration
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Delete every queued event
    Clear {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    SyncCoreConfig::load_env_file()?;
    let config = SyncCoreConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Transitions { role, from } => transitions_command(role, from),
        Commands::Queue { action } => {
            init_telemetry(&config.observability)?;
            let result = tokio::runtime::Runtime::new()?.block_on(async {
                match action {
                    QueueAction::Inspect { path } => queue_inspect_command(&config, path).await,
                    QueueAction::Clear { path } => queue_clear_command(&config, path).await,
                }
            });
            shutdown_telemetry();
            result
        }
        Commands::Config { action: ConfigAction::Show } => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn transitions_command(role: Option<Role>, from: Option<TaskStatus>) -> Result<()> {
    let roles: Vec<Role> = role.map(|r| vec![r]).unwrap_or_else(|| Role::ALL.to_vec());
    let sources: Vec<TaskStatus> = from.map(|s| vec![s]).unwrap_or_else(|| TaskStatus::ALL.to_vec());

    for role in roles {
        println!("{role}:");
        for status in &sources {
            let targets = allowed_transitions(*status, role);
            let rendered = if targets.is_empty() {
                "(terminal)".to_string()
            } else {
                targets
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("  {:<22} -> {}", status.as_str(), rendered);
        }
    }
    Ok(())
}

fn queue_store(config: &SyncCoreConfig, path: Option<PathBuf>) -> FileQueueStore {
    FileQueueStore::new(path.unwrap_or_else(|| config.queue.path.clone()))
}

async fn queue_inspect_command(config: &SyncCoreConfig, path: Option<PathBuf>) -> Result<()> {
    let store = queue_store(config, path);
    let events = store
        .load()
        .await
        .with_context(|| format!("failed to read queue at {}", store.path().display()))?;

    if events.is_empty() {
        println!("No queued events in {}", store.path().display());
        return Ok(());
    }

    println!("{} queued event(s) in {}", events.len(), store.path().display());
    for event in events {
        let subject = event.subject_id.as_deref().unwrap_or("-");
        println!(
            "  {}  {:<24} subject={} session={}",
            event.timestamp.to_rfc3339(),
            event.name,
            subject,
            event.session_id
        );
    }
    Ok(())
}

async fn queue_clear_command(config: &SyncCoreConfig, path: Option<PathBuf>) -> Result<()> {
    let store = queue_store(config, path);
    let events = store.load().await?;
    store
        .save(&[])
        .await
        .with_context(|| format!("failed to clear queue at {}", store.path().display()))?;
    println!("Cleared {} queued event(s) from {}", events.len(), store.path().display());
    Ok(())
}
