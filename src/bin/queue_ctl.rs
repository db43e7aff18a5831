use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use scout_sync::config;
use scout_sync::db;
use scout_sync::model::{EntryStatus, SyncConfigUpdate};
use scout_sync::remote::RemoteClient;
use scout_sync::sync::SyncOrchestrator;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and operate the offline sync queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List queued entries, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Count entries per status
    Stats,
    /// Run one sync pass now
    Sync,
    /// Requeue errored entries (except server rejections) and run a pass
    RetryFailed,
    /// Delete synced entries
    ClearSynced,
    /// Show recent sync results
    Logs {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show or change the persisted sync config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    Set {
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        retry_delay_ms: Option<u64>,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        auto_sync_enabled: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let client = Arc::new(RemoteClient::from_config(&cfg)?);
    let orchestrator = SyncOrchestrator::new(pool.clone(), client, cfg.sync.defaults())
        .with_stale_after(Duration::from_secs(cfg.sync.stale_after_secs));

    match args.command {
        Command::List { status } => {
            let entries = match status {
                Some(raw) => {
                    let Some(status) = EntryStatus::parse_status(&raw) else {
                        bail!("unknown status {:?}", raw);
                    };
                    db::entries_with_status(&pool, status).await?
                }
                None => db::get_all(&pool).await?,
            };
            for entry in &entries {
                println!(
                    "{}\t{}\t{}{}\tattempts={}\tremote_id={}\t{}",
                    entry.id,
                    entry.kind.as_str(),
                    entry.status.as_str(),
                    if entry.rejected { " (rejected)" } else { "" },
                    entry.attempts,
                    entry.remote_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    entry.error.as_deref().unwrap_or("")
                );
            }
            info!(count = entries.len(), "listed entries");
        }
        Command::Stats => {
            let stats = db::queue_stats(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Sync => {
            let result = orchestrator.sync_pending_entries().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::RetryFailed => {
            let result = orchestrator.retry_failed_entries().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::ClearSynced => {
            let removed = db::clear_synced(&pool).await?;
            println!("removed {} synced entries", removed);
        }
        Command::Logs { limit } => {
            for log in db::recent_sync_logs(&pool, limit).await? {
                println!("{}", serde_json::to_string(&log)?);
            }
        }
        Command::Config { action } => {
            let current = match action {
                ConfigAction::Show => orchestrator.config().await?,
                ConfigAction::Set {
                    max_retries,
                    retry_delay_ms,
                    batch_size,
                    auto_sync_enabled,
                } => {
                    if batch_size == Some(0) {
                        bail!("batch_size must be > 0");
                    }
                    let update = SyncConfigUpdate {
                        max_retries,
                        retry_delay_ms,
                        batch_size,
                        auto_sync_enabled,
                    };
                    orchestrator.update_config(&update).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&current)?);
        }
    }

    Ok(())
}
