//! Fieldkeep CLI - Command line interface for the durability core.
//!
//! Every command opens the durability services over a data directory, runs one
//! operation and exits, except `run`, which drives the scheduler until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldkeep_common::CollectionName;
use fieldkeep_storage::{JsonFileProvider, LocalStore};
use fieldkeep_sync::{
    CollectionIntegrity, Connectivity, DurabilityConfig, LogNotifier, OfflineOperation,
    OperationKind, RestoreSource, Scheduler, Services, StoreTransport, SubmitOutcome,
};

#[derive(Parser)]
#[command(name = "fieldkeep")]
#[command(about = "Fieldkeep - Backup, versioning and sync for field data")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding durability records (default: platform data dir).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Configuration file (default: <home>/config.json when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Application data document (default: <home>/data.json).
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Directory standing in for the remote (default: <home>/remote).
    #[arg(long, global = true)]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a backup now.
    Backup,

    /// Restore from the remote, falling back to the local snapshot.
    Restore {
        /// Skip the remote and re-apply the local snapshot.
        #[arg(long)]
        local: bool,
    },

    /// Show the backup history.
    History {
        #[arg(short, long, default_value_t = 7)]
        limit: usize,
    },

    /// Show aggregate backup metrics.
    Metrics,

    /// Validate the current snapshot.
    Validate,

    /// List recorded versions.
    Versions {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Revert to a recorded version.
    Revert {
        /// Version id.
        id: String,
    },

    /// Sync the current snapshot with the remote.
    Sync,

    /// Show sync and schedule status.
    Status,

    /// Inspect and operate the offline queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show or change the backup schedule.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Run the scheduler in the foreground until Ctrl-C.
    Run {
        /// Start disconnected; queued operations wait.
        #[arg(long)]
        offline: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Submit a mutation, applying it now or queueing it.
    Add {
        kind: KindArg,
        /// Target collection.
        collection: String,
        /// Record as JSON; must carry an "id".
        record: String,
        /// Queue without attempting to apply.
        #[arg(long)]
        offline: bool,
    },
    /// List pending and failed operations.
    List,
    /// Drain the queue once.
    Drain,
    /// Reset a failed operation to pending.
    Retry { id: String },
    /// Drop all failed operations.
    Clear,
}

#[derive(Subcommand)]
enum ScheduleAction {
    Show,
    Set {
        #[arg(long)]
        daily: Option<bool>,
        #[arg(long)]
        weekly: Option<bool>,
        #[arg(long)]
        monthly: Option<bool>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Create,
    Update,
    Delete,
}

impl From<KindArg> for OperationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Create => OperationKind::Create,
            KindArg::Update => OperationKind::Update,
            KindArg::Delete => OperationKind::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let home = match &cli.home {
        Some(home) => home.clone(),
        None => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldkeep"),
    };
    let offline = matches!(cli.command, Commands::Run { offline: true });
    let scheduler = open_scheduler(&cli, &home, !offline).await?;

    match cli.command {
        Commands::Backup => cmd_backup(&scheduler).await,
        Commands::Restore { local } => cmd_restore(&scheduler, local).await,
        Commands::History { limit } => cmd_history(&scheduler, limit).await,
        Commands::Metrics => cmd_metrics(&scheduler).await,
        Commands::Validate => cmd_validate(&scheduler).await,
        Commands::Versions { limit } => cmd_versions(&scheduler, limit).await,
        Commands::Revert { id } => cmd_revert(&scheduler, &id).await,
        Commands::Sync => cmd_sync(&scheduler).await,
        Commands::Status => cmd_status(&scheduler).await,
        Commands::Queue { action } => cmd_queue(&scheduler, action).await,
        Commands::Schedule { action } => cmd_schedule(&scheduler, action).await,
        Commands::Run { .. } => cmd_run(&scheduler).await,
    }
}

/// Load the configuration: explicit file, then `<home>/config.json`, then
/// defaults.
async fn load_config(explicit: Option<&Path>, home: &Path) -> Result<DurabilityConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = home.join("config.json");
            if !tokio::fs::try_exists(&default).await.unwrap_or(false) {
                return Ok(DurabilityConfig::default());
            }
            default
        }
    };

    let json = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    DurabilityConfig::from_json(&json)
        .with_context(|| format!("Invalid config {}", path.display()))
}

async fn open_scheduler(cli: &Cli, home: &Path, online: bool) -> Result<Scheduler> {
    let config = load_config(cli.config.as_deref(), home).await?;

    let store = LocalStore::new(home.join("records")).context("Failed to open record store")?;
    let data = cli.data.clone().unwrap_or_else(|| home.join("data.json"));
    let provider = JsonFileProvider::new(&data, config.collections.clone());
    let remote_dir = cli.remote.clone().unwrap_or_else(|| home.join("remote"));
    let remote = LocalStore::new(&remote_dir).context("Failed to open remote directory")?;

    info!("Data directory: {}", home.display());

    let services = Services::open(
        config,
        Arc::new(store),
        Arc::new(provider),
        Arc::new(StoreTransport::new(Arc::new(remote))),
        Arc::new(LogNotifier),
    )
    .await
    .context("Failed to open durability services")?;

    Scheduler::open(services, Connectivity::new(online))
        .await
        .context("Failed to open scheduler")
}

async fn cmd_backup(scheduler: &Scheduler) -> Result<()> {
    let entry = scheduler
        .trigger_backup()
        .await
        .context("Backup failed")?;

    println!("Backup created:");
    println!("  Snapshot: {}", entry.snapshot_id.as_deref().unwrap_or("-"));
    println!("  Size: {} bytes", entry.size_bytes);
    println!("  Schema: {}", entry.schema_version);

    Ok(())
}

async fn cmd_restore(scheduler: &Scheduler, local: bool) -> Result<()> {
    if local {
        let id = scheduler
            .restore_local()
            .await
            .context("Local restore failed")?;
        println!("Restored local snapshot {}", id);
        return Ok(());
    }

    match scheduler.restore().await.context("Restore failed")? {
        RestoreSource::Remote(meta) => {
            println!("Restored remote snapshot {}", meta.remote_id);
            println!("  Taken: {}", meta.timestamp);
        }
        RestoreSource::Local(id) => {
            println!("Remote unreachable, restored local snapshot {}", id);
        }
    }
    Ok(())
}

async fn cmd_history(scheduler: &Scheduler, limit: usize) -> Result<()> {
    let history = scheduler.services().snapshots.get_history(limit).await;

    if history.is_empty() {
        println!("No backups yet.");
        return Ok(());
    }
    for entry in history {
        if entry.is_success() {
            println!(
                "  [OK]     {} {} ({} bytes)",
                entry.timestamp.to_rfc3339(),
                entry.snapshot_id.as_deref().unwrap_or("-"),
                entry.size_bytes
            );
        } else {
            println!(
                "  [FAILED] {} {}",
                entry.timestamp.to_rfc3339(),
                entry.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

async fn cmd_metrics(scheduler: &Scheduler) -> Result<()> {
    let metrics = scheduler.services().snapshots.get_metrics().await;

    println!("Backup Metrics:");
    println!("  Total: {}", metrics.total_backups);
    println!("  Successful: {}", metrics.successful_backups);
    println!("  Failed: {}", metrics.failed_backups);
    println!("  Success ratio: {:.2}", metrics.success_ratio);
    println!("  Total size: {} bytes", metrics.total_size_bytes);
    if let Some(at) = metrics.last_backup_at {
        println!("  Last backup: {}", at.to_rfc3339());
    }
    if let Some(at) = metrics.last_successful_backup_at {
        println!("  Last success: {}", at.to_rfc3339());
    }
    Ok(())
}

fn integrity_line(name: &CollectionName, integrity: &CollectionIntegrity) -> String {
    format!(
        "{}: present={} well_formed={} populated={} records={}",
        name,
        integrity.present,
        integrity.well_formed,
        integrity.populated,
        integrity.record_count
    )
}

async fn cmd_validate(scheduler: &Scheduler) -> Result<()> {
    let result = scheduler.trigger_validation().await?;

    println!(
        "Snapshot is {} (loaded in {} ms, {} bytes)",
        if result.is_valid { "valid" } else { "INVALID" },
        result.performance.load_time_ms,
        result.performance.size_bytes
    );
    for issue in &result.errors {
        println!("  error:   {}", issue.message);
    }
    for issue in &result.warnings {
        println!("  warning: {}", issue.message);
    }
    for (name, integrity) in &result.data_integrity {
        println!("  {}", integrity_line(name, integrity));
    }

    if !result.is_valid {
        anyhow::bail!("Validation failed");
    }
    Ok(())
}

async fn cmd_versions(scheduler: &Scheduler, limit: usize) -> Result<()> {
    let versions = scheduler.services().ledger.get_history(limit).await;

    if versions.is_empty() {
        println!("No versions recorded.");
        return Ok(());
    }
    for record in versions {
        let mut flags = Vec::new();
        if record.superseded {
            flags.push("superseded".to_string());
        }
        if let Some(from) = &record.reverted_from {
            flags.push(format!("revert of {}", from));
        }
        println!(
            "  {} {} {:?}/{:?} [{}]{}",
            record.id,
            record.timestamp.to_rfc3339(),
            record.origin,
            record.sync_status,
            record.delta,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        );
    }
    Ok(())
}

async fn cmd_revert(scheduler: &Scheduler, id: &str) -> Result<()> {
    let record = scheduler.revert(id).await.context("Revert failed")?;
    println!("Reverted to {} as new version {}", id, record.id);
    println!("  Changes: {}", record.delta);
    Ok(())
}

async fn cmd_sync(scheduler: &Scheduler) -> Result<()> {
    let state = scheduler.trigger_sync().await.context("Sync failed")?;

    println!("Sync {}", state.status);
    if let Some(remote) = &state.remote_snapshot_id {
        println!("  Remote: {}", remote);
    }
    if let Some(err) = &state.last_error {
        println!("  Last error: {}", err);
    }
    Ok(())
}

async fn cmd_status(scheduler: &Scheduler) -> Result<()> {
    let services = scheduler.services();
    let state = services.coordinator.get_state().await;
    let schedule = scheduler.schedule().await;
    let pending = services.queue.get_pending().await.len();
    let failed = services.queue.get_failed().await.len();

    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    };

    println!("Sync:");
    println!("  Status: {}", state.status);
    println!("  Last sync: {}", fmt_time(state.last_sync_timestamp));
    if let Some(err) = &state.last_error {
        println!("  Last error: {}", err);
    }
    println!("Schedule:");
    println!("  Last backup: {}", fmt_time(schedule.last_backup_at));
    println!("  Last validation: {}", fmt_time(schedule.last_validation_at));
    println!("  Validation: {:?}", schedule.validation_status);
    println!("Queue:");
    println!("  Pending: {}", pending);
    println!("  Failed: {}", failed);
    Ok(())
}

async fn cmd_queue(scheduler: &Scheduler, action: QueueAction) -> Result<()> {
    let queue = &scheduler.services().queue;

    match action {
        QueueAction::Add {
            kind,
            collection,
            record,
            offline,
        } => {
            let collection = CollectionName::new(collection).context("Invalid collection")?;
            let payload: serde_json::Value =
                serde_json::from_str(&record).context("Record is not valid JSON")?;
            let op = OfflineOperation::new(kind.into(), collection, payload);

            if offline {
                scheduler.connectivity().set_online(false);
            }
            match scheduler.submit(op).await.context("Submit failed")? {
                SubmitOutcome::Applied => println!("Applied."),
                SubmitOutcome::Queued(id) => println!("Queued as {}", id),
            }
        }
        QueueAction::List => {
            let pending = queue.get_pending().await;
            let failed = queue.get_failed().await;
            if pending.is_empty() && failed.is_empty() {
                println!("Queue is empty.");
            }
            for op in pending.iter().chain(failed.iter()) {
                println!(
                    "  {} {:?} {} {} attempts={}{}",
                    op.id,
                    op.status,
                    op.kind,
                    op.target_collection,
                    op.attempt_count,
                    op.last_error
                        .as_deref()
                        .map(|e| format!(" error={}", e))
                        .unwrap_or_default()
                );
            }
        }
        QueueAction::Drain => {
            let report = scheduler.trigger_drain().await.context("Drain failed")?;
            println!(
                "Applied {}, retrying {}, failed {}, deferred {}",
                report.applied.len(),
                report.retried,
                report.failed.len(),
                report.deferred
            );
        }
        QueueAction::Retry { id } => {
            let op = queue.retry_failed(&id).await.context("Retry failed")?;
            println!("Operation {} is pending again", op.id);
        }
        QueueAction::Clear => {
            let dropped = queue.clear_failed().await?;
            println!("Dropped {} failed operations", dropped);
        }
    }
    Ok(())
}

async fn cmd_schedule(scheduler: &Scheduler, action: ScheduleAction) -> Result<()> {
    let schedule = match action {
        ScheduleAction::Show => scheduler.schedule().await,
        ScheduleAction::Set {
            daily,
            weekly,
            monthly,
        } => {
            scheduler
                .update_schedule(|s| {
                    if let Some(daily) = daily {
                        s.backup_enabled.daily = daily;
                    }
                    if let Some(weekly) = weekly {
                        s.backup_enabled.weekly = weekly;
                    }
                    if let Some(monthly) = monthly {
                        s.backup_enabled.monthly = monthly;
                    }
                })
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&schedule)?);
    Ok(())
}

async fn cmd_run(scheduler: &Scheduler) -> Result<()> {
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    scheduler.shutdown();

    if let Err(e) = handle.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_line_prints_record_count() {
        let name = CollectionName::new("favorites").unwrap();
        let integrity = CollectionIntegrity {
            present: true,
            well_formed: true,
            populated: true,
            record_count: 3,
        };
        assert_eq!(
            integrity_line(&name, &integrity),
            "favorites: present=true well_formed=true populated=true records=3"
        );
    }
}
