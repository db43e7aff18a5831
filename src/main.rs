use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use scout_sync::bridge::{self, BackgroundSyncBridge, LogNotifier, PollingRegistrar};
use scout_sync::config;
use scout_sync::db;
use scout_sync::remote::RemoteClient;
use scout_sync::sync::SyncOrchestrator;

const SYNC_LOG_KEEP: u32 = 500;

#[derive(Debug, Parser)]
#[command(author, version, about = "Drain the offline scouting queue whenever the server is reachable")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let client = Arc::new(RemoteClient::from_config(&cfg)?);
    let stale_after = Duration::from_secs(cfg.sync.stale_after_secs);
    let orchestrator = Arc::new(
        SyncOrchestrator::new(pool.clone(), client.clone(), cfg.sync.defaults())
            .with_stale_after(stale_after),
    );
    let sync_config = orchestrator.config().await?;
    info!(?sync_config, "sync config loaded");

    let recovered = orchestrator
        .recover_stale(stale_after)
        .await?;
    let pruned = db::prune_sync_logs(&pool, SYNC_LOG_KEEP).await?;
    let stats = db::queue_stats(&pool).await?;
    info!(
        pending = stats.pending,
        errored = stats.error,
        recovered,
        pruned,
        "queue opened"
    );

    let retry_worker = orchestrator.clone().spawn_retry_worker();

    let registrar = Arc::new(PollingRegistrar::new());
    let sync_bridge = Arc::new(BackgroundSyncBridge::new(
        orchestrator.clone(),
        Arc::new(LogNotifier),
        registrar.clone(),
        client,
    ));
    // First online poll drains whatever was queued before startup.
    sync_bridge.request_background_sync().await;

    let mut events = sync_bridge.subscribe();
    let relay = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "bridge event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "bridge event relay lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let watcher = bridge::run_connectivity_watcher(
        sync_bridge,
        registrar,
        Duration::from_millis(cfg.app.poll_interval_ms),
    );

    info!("scout-sync running; press ctrl-c to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    watcher.abort();
    retry_worker.abort();
    relay.abort();
    Ok(())
}
