use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};

use scout_sync::cache::{self, CacheContext, CacheRole};
use scout_sync::config;
use scout_sync::db;
use scout_sync::model::{CacheMode, CacheStepStatus};
use scout_sync::remote::RemoteClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Download event data for offline use")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Scout,
    Full,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Cache an event
    Run {
        #[arg(long)]
        event: String,
        #[arg(long)]
        year: i32,
        #[arg(long, value_enum, default_value = "scout")]
        mode: ModeArg,
        /// Permission level of the signed-in user: scout or admin
        #[arg(long, default_value = "scout")]
        role: String,
    },
    /// Drop an event's cached records and status
    Clear {
        #[arg(long)]
        event: String,
    },
    /// Show cache status for one event, or every cached event
    Status {
        #[arg(long)]
        event: Option<String>,
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

    match args.command {
        Command::Run {
            event,
            year,
            mode,
            role,
        } => {
            let role = CacheRole::parse_role(&role)
                .ok_or_else(|| anyhow!("unknown role {:?}; expected scout or admin", role))?;
            let mode = match mode {
                ModeArg::Scout => CacheMode::Scout,
                ModeArg::Full => CacheMode::Full,
            };
            let client = RemoteClient::from_config(&cfg)?;
            let ctx = CacheContext {
                event_code: event,
                year,
                role,
                pages: cfg.cache.pages.clone(),
            };

            let result = cache::run_event_cache(&pool, &client, mode, &ctx, |step| {
                match step.status {
                    CacheStepStatus::Pending => {}
                    CacheStepStatus::Loading => info!(step = step.label.as_str(), "loading"),
                    CacheStepStatus::Error => error!(
                        step = step.label.as_str(),
                        error = step.error.as_deref().unwrap_or(""),
                        "failed"
                    ),
                    _ => info!(
                        step = step.label.as_str(),
                        status = ?step.status,
                        detail = step.detail.as_deref().unwrap_or(""),
                        "done"
                    ),
                }
            })
            .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Clear { event } => {
            let deleted = cache::clear_event_cache(&pool, &event).await?;
            println!("removed {} cached records for {}", deleted, event);
        }
        Command::Status { event } => {
            let statuses: Vec<_> = match event {
                Some(event) => db::get_event_cache_status(&pool, &event)
                    .await?
                    .into_iter()
                    .collect(),
                None => db::list_cached_events(&pool).await?,
            };
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }

    Ok(())
}
