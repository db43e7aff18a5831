use super::model::{entry_from_row, sync_config_from_row, sync_result_from_row, ENTRY_COLUMNS};
use crate::error::StoreError;
use crate::model::{
    EntryKind, EntryStatus, QueueStats, QueuedEntry, SyncConfig, SyncConfigUpdate, SyncResult,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

pub type Pool = SqlitePool;
pub type StoreResult<T> = Result<T, StoreError>;

pub async fn init_pool(database_url: &str) -> StoreResult<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // Enable WAL and stricter durability on every pooled connection.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    // Each in-memory connection is its own database, so keep exactly one alive.
    let pool_options = if normalized.starts_with("sqlite::memory") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Time-based id with a random suffix, e.g. `1718000000000-3f9c2a7b1`.
pub fn new_entry_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..9])
}

#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, kind: EntryKind, data: &Value) -> StoreResult<String> {
    let id = new_entry_id();
    let payload = serde_json::to_string(data)?;
    sqlx::query(
        "INSERT INTO queue_entries (id, kind, status, data, created_at, attempts) VALUES (?, ?, 'pending', ?, ?, 0)",
    )
    .bind(&id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    info!(id = %id, kind = kind.as_str(), "entry queued");
    Ok(id)
}

/// Record an entry that was delivered directly, so it stays visible for inspection.
#[instrument(skip_all)]
pub async fn insert_synced(
    pool: &Pool,
    kind: EntryKind,
    data: &Value,
    remote_id: i64,
) -> StoreResult<String> {
    let id = new_entry_id();
    let payload = serde_json::to_string(data)?;
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO queue_entries (id, kind, status, data, created_at, last_attempt, attempts, remote_id) \
         VALUES (?, ?, 'synced', ?, ?, ?, 1, ?)",
    )
    .bind(&id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(now)
    .bind(now)
    .bind(remote_id)
    .execute(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_pending(pool: &Pool) -> StoreResult<Vec<QueuedEntry>> {
    entries_with_status(pool, EntryStatus::Pending).await
}

pub async fn entries_with_status(
    pool: &Pool,
    status: EntryStatus,
) -> StoreResult<Vec<QueuedEntry>> {
    let sql = format!(
        "SELECT {} FROM queue_entries WHERE status = ? ORDER BY rowid",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_all(pool: &Pool) -> StoreResult<Vec<QueuedEntry>> {
    let sql = format!("SELECT {} FROM queue_entries ORDER BY rowid", ENTRY_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

pub async fn get_entry(pool: &Pool, id: &str) -> StoreResult<Option<QueuedEntry>> {
    let sql = format!("SELECT {} FROM queue_entries WHERE id = ?", ENTRY_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// Record a processing attempt: bumps `attempts`, stamps `last_attempt`.
///
/// `remote_id` is only written while unset, so a synced entry keeps the id it
/// was first assigned. `error` is cleared when the entry becomes `synced` and
/// otherwise only replaced when a new message is given.
#[instrument(skip_all)]
pub async fn update_status(
    pool: &Pool,
    id: &str,
    status: EntryStatus,
    remote_id: Option<i64>,
    error: Option<&str>,
) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE queue_entries SET status = ?1, attempts = attempts + 1, last_attempt = ?2, \
         remote_id = COALESCE(remote_id, ?3), \
         error = CASE WHEN ?1 = 'synced' THEN NULL ELSE COALESCE(?4, error) END \
         WHERE id = ?5",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(remote_id)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Atomically move an entry from `pending` to `syncing`, counting the attempt.
///
/// Returns `None` when the entry is gone or another context already claimed it.
#[instrument(skip_all)]
pub async fn claim_entry(pool: &Pool, id: &str) -> StoreResult<Option<QueuedEntry>> {
    let sql = format!(
        "UPDATE queue_entries SET status = 'syncing', attempts = attempts + 1, last_attempt = ? \
         WHERE id = ? AND status = 'pending' RETURNING {}",
        ENTRY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// Record the outcome of a claimed attempt without counting another attempt.
#[instrument(skip_all)]
pub async fn finish_attempt(
    pool: &Pool,
    id: &str,
    status: EntryStatus,
    remote_id: Option<i64>,
    error: Option<&str>,
) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE queue_entries SET status = ?1, remote_id = COALESCE(remote_id, ?2), \
         error = CASE WHEN ?1 = 'synced' THEN NULL ELSE COALESCE(?3, error) END \
         WHERE id = ?4",
    )
    .bind(status.as_str())
    .bind(remote_id)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Park a claimed entry the server refused. It is kept for inspection but
/// never requeued by [`reset_errors`].
#[instrument(skip_all)]
pub async fn mark_rejected(pool: &Pool, id: &str, error: &str) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE queue_entries SET status = 'error', rejected = 1, error = ?1 WHERE id = ?2",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn remove(pool: &Pool, id: &str) -> StoreResult<()> {
    let res = sqlx::query("DELETE FROM queue_entries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_synced(pool: &Pool) -> StoreResult<u64> {
    let res = sqlx::query("DELETE FROM queue_entries WHERE status = 'synced'")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn count(pool: &Pool, status: Option<EntryStatus>) -> StoreResult<i64> {
    let n: i64 = match status {
        Some(status) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(n)
}

pub async fn queue_stats(pool: &Pool) -> StoreResult<QueueStats> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")
            .fetch_all(pool)
            .await?;
    let mut stats = QueueStats::default();
    for (status, n) in rows {
        match EntryStatus::parse_status(&status) {
            Some(EntryStatus::Pending) => stats.pending = n,
            Some(EntryStatus::Syncing) => stats.syncing = n,
            Some(EntryStatus::Synced) => stats.synced = n,
            Some(EntryStatus::Error) => stats.error = n,
            None => return Err(StoreError::Corrupt(format!("unknown status {}", status))),
        }
    }
    Ok(stats)
}

/// Put every retryable `error` entry back to `pending`. Rejected entries stay
/// parked. Returns the number moved.
#[instrument(skip_all)]
pub async fn reset_errors(pool: &Pool) -> StoreResult<u64> {
    let res = sqlx::query(
        "UPDATE queue_entries SET status = 'pending' WHERE status = 'error' AND rejected = 0",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Requeue entries left in `syncing` by a context that died mid-attempt.
#[instrument(skip_all)]
pub async fn requeue_stale_syncing(pool: &Pool, older_than: DateTime<Utc>) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;
    let rows: Vec<(String, Option<DateTime<Utc>>)> =
        sqlx::query_as("SELECT id, last_attempt FROM queue_entries WHERE status = 'syncing'")
            .fetch_all(&mut *tx)
            .await?;
    let mut moved = 0;
    for (id, last_attempt) in rows {
        if last_attempt.map_or(true, |at| at < older_than) {
            moved += sqlx::query(
                "UPDATE queue_entries SET status = 'pending' WHERE id = ? AND status = 'syncing'",
            )
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
    }
    tx.commit().await?;
    Ok(moved)
}

#[instrument(skip_all)]
pub async fn append_sync_log(pool: &Pool, result: &SyncResult) -> StoreResult<i64> {
    let errors = serde_json::to_string(&result.errors)?;
    let row = sqlx::query(
        "INSERT INTO sync_log (success, synced_count, failed_count, errors, timestamp) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(result.success)
    .bind(i64::from(result.synced_count))
    .bind(i64::from(result.failed_count))
    .bind(errors)
    .bind(result.timestamp)
    .fetch_one(pool)
    .await?;
    Ok(row.try_get::<i64, _>("id")?)
}

pub async fn recent_sync_logs(pool: &Pool, limit: u32) -> StoreResult<Vec<SyncResult>> {
    let rows = sqlx::query(
        "SELECT success, synced_count, failed_count, errors, timestamp FROM sync_log \
         ORDER BY timestamp DESC, id DESC LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(sync_result_from_row).collect()
}

/// Drop all but the newest `keep` log rows. Returns the number deleted.
pub async fn prune_sync_logs(pool: &Pool, keep: u32) -> StoreResult<u64> {
    let res = sqlx::query(
        "DELETE FROM sync_log WHERE id NOT IN \
         (SELECT id FROM sync_log ORDER BY timestamp DESC, id DESC LIMIT ?)",
    )
    .bind(i64::from(keep))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn get_config(pool: &Pool) -> StoreResult<Option<SyncConfig>> {
    let row = sqlx::query(
        "SELECT max_retries, retry_delay_ms, batch_size, auto_sync_enabled FROM sync_config WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(sync_config_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn set_config(pool: &Pool, config: &SyncConfig) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    upsert_config_tx(&mut tx, config).await?;
    tx.commit().await?;
    Ok(())
}

/// Read the stored config, persisting `defaults` on first use.
pub async fn get_or_init_config(pool: &Pool, defaults: &SyncConfig) -> StoreResult<SyncConfig> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query(
        "SELECT max_retries, retry_delay_ms, batch_size, auto_sync_enabled FROM sync_config WHERE id = 1",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let config = match existing {
        Some(row) => sync_config_from_row(&row)?,
        None => {
            upsert_config_tx(&mut tx, defaults).await?;
            *defaults
        }
    };
    tx.commit().await?;
    Ok(config)
}

#[instrument(skip_all)]
pub async fn update_config(
    pool: &Pool,
    defaults: &SyncConfig,
    update: &SyncConfigUpdate,
) -> StoreResult<SyncConfig> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query(
        "SELECT max_retries, retry_delay_ms, batch_size, auto_sync_enabled FROM sync_config WHERE id = 1",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let base = match existing {
        Some(row) => sync_config_from_row(&row)?,
        None => *defaults,
    };
    let merged = update.apply(base);
    upsert_config_tx(&mut tx, &merged).await?;
    tx.commit().await?;
    Ok(merged)
}

async fn upsert_config_tx(
    tx: &mut Transaction<'_, Sqlite>,
    config: &SyncConfig,
) -> StoreResult<()> {
    let retry_delay_ms = i64::try_from(config.retry_delay_ms)
        .map_err(|_| StoreError::Corrupt(format!("retry_delay_ms {}", config.retry_delay_ms)))?;
    sqlx::query(
        "INSERT INTO sync_config (id, max_retries, retry_delay_ms, batch_size, auto_sync_enabled, updated_at) \
         VALUES (1, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET max_retries = excluded.max_retries, \
         retry_delay_ms = excluded.retry_delay_ms, batch_size = excluded.batch_size, \
         auto_sync_enabled = excluded.auto_sync_enabled, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(i64::from(config.max_retries))
    .bind(retry_delay_ms)
    .bind(i64::from(config.batch_size))
    .bind(config.auto_sync_enabled)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
