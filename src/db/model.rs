//! Row mapping for the queue and cache tables.
//!
//! Keep these helpers focused on turning rows into domain types. Business
//! logic should live in higher layers.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::StoreError;
use crate::model::{EntryKind, EntryStatus, EventCacheStatus, QueuedEntry, SyncConfig, SyncResult};

pub(crate) const ENTRY_COLUMNS: &str =
    "id, kind, status, data, created_at, last_attempt, attempts, remote_id, error, rejected";

pub(crate) fn entry_from_row(row: &SqliteRow) -> Result<QueuedEntry, StoreError> {
    let id: String = row.try_get("id")?;
    let kind_str: String = row.try_get("kind")?;
    let kind = EntryKind::parse_kind(&kind_str)
        .ok_or_else(|| StoreError::Corrupt(format!("entry {} has unknown kind {}", id, kind_str)))?;
    let status_str: String = row.try_get("status")?;
    let status = EntryStatus::parse_status(&status_str).ok_or_else(|| {
        StoreError::Corrupt(format!("entry {} has unknown status {}", id, status_str))
    })?;
    let raw: String = row.try_get("data")?;
    let data = serde_json::from_str(&raw)?;

    Ok(QueuedEntry {
        kind,
        status,
        data,
        created_at: row.try_get("created_at")?,
        last_attempt: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt")?,
        attempts: row.try_get("attempts")?,
        remote_id: row.try_get::<Option<i64>, _>("remote_id")?,
        error: row.try_get::<Option<String>, _>("error")?,
        rejected: row.try_get("rejected")?,
        id,
    })
}

pub(crate) fn sync_result_from_row(row: &SqliteRow) -> Result<SyncResult, StoreError> {
    let errors: String = row.try_get("errors")?;
    Ok(SyncResult {
        success: row.try_get("success")?,
        synced_count: to_u32(row.try_get("synced_count")?, "synced_count")?,
        failed_count: to_u32(row.try_get("failed_count")?, "failed_count")?,
        errors: serde_json::from_str(&errors)?,
        timestamp: row.try_get("timestamp")?,
    })
}

pub(crate) fn sync_config_from_row(row: &SqliteRow) -> Result<SyncConfig, StoreError> {
    let retry_delay_ms: i64 = row.try_get("retry_delay_ms")?;
    Ok(SyncConfig {
        max_retries: to_u32(row.try_get("max_retries")?, "max_retries")?,
        retry_delay_ms: u64::try_from(retry_delay_ms)
            .map_err(|_| StoreError::Corrupt(format!("retry_delay_ms {}", retry_delay_ms)))?,
        batch_size: to_u32(row.try_get("batch_size")?, "batch_size")?,
        auto_sync_enabled: row.try_get("auto_sync_enabled")?,
    })
}

pub(crate) fn cache_status_from_row(row: &SqliteRow) -> Result<EventCacheStatus, StoreError> {
    Ok(EventCacheStatus {
        event_code: row.try_get("event_code")?,
        year: row.try_get("year")?,
        cached_at: row.try_get("cached_at")?,
        teams_count: row.try_get("teams_count")?,
        pit_entries_count: row.try_get("pit_entries_count")?,
        match_entries_count: row.try_get("match_entries_count")?,
        pages_cached: row.try_get("pages_cached")?,
        session_cached: row.try_get("session_cached")?,
        schedules_cached: row.try_get("schedules_cached")?,
    })
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}
