//! Persistence for reference data cached by the event cache pipeline.
//!
//! Independent of the sync queue: clearing an event never touches
//! `queue_entries`.

use super::model::cache_status_from_row;
use super::repo::{Pool, StoreResult};
use crate::error::StoreError;
use crate::model::EventCacheStatus;
use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

/// Replace every cached record of `kind` for an event. Returns the number stored.
#[instrument(skip_all, fields(event_code = %event_code, kind = %kind))]
pub async fn replace_cached_records(
    pool: &Pool,
    event_code: &str,
    kind: &str,
    records: &[(String, Value)],
) -> StoreResult<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM cached_records WHERE event_code = ? AND kind = ?")
        .bind(event_code)
        .bind(kind)
        .execute(&mut *tx)
        .await?;
    let now = Utc::now();
    for (key, payload) in records {
        sqlx::query(
            "INSERT OR REPLACE INTO cached_records (event_code, kind, record_key, payload, cached_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event_code)
        .bind(kind)
        .bind(key)
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    let stored: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM cached_records WHERE event_code = ? AND kind = ?")
            .bind(event_code)
            .bind(kind)
            .fetch_one(&mut *tx)
            .await?;
    tx.commit().await?;
    Ok(stored)
}

pub async fn cached_records(pool: &Pool, event_code: &str, kind: &str) -> StoreResult<Vec<Value>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT payload FROM cached_records WHERE event_code = ? AND kind = ? ORDER BY rowid",
    )
    .bind(event_code)
    .bind(kind)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|raw| serde_json::from_str::<Value>(raw).map_err(StoreError::from))
        .collect()
}

pub async fn upsert_page(pool: &Pool, path: &str, body: &str) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO cached_pages (path, body, cached_at) VALUES (?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET body = excluded.body, cached_at = excluded.cached_at",
    )
    .bind(path)
    .bind(body)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_page(pool: &Pool, path: &str) -> StoreResult<Option<String>> {
    let body = sqlx::query_scalar("SELECT body FROM cached_pages WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(body)
}

pub async fn store_session(pool: &Pool, session: &Value) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO cached_session (id, payload, cached_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, cached_at = excluded.cached_at",
    )
    .bind(serde_json::to_string(session)?)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_session(pool: &Pool) -> StoreResult<Option<Value>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT payload FROM cached_session WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

#[instrument(skip_all)]
pub async fn upsert_event_cache_status(pool: &Pool, status: &EventCacheStatus) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO event_cache_status \
         (event_code, year, cached_at, teams_count, pit_entries_count, match_entries_count, \
          pages_cached, session_cached, schedules_cached) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&status.event_code)
    .bind(status.year)
    .bind(status.cached_at)
    .bind(status.teams_count)
    .bind(status.pit_entries_count)
    .bind(status.match_entries_count)
    .bind(status.pages_cached)
    .bind(status.session_cached)
    .bind(status.schedules_cached)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_event_cache_status(
    pool: &Pool,
    event_code: &str,
) -> StoreResult<Option<EventCacheStatus>> {
    let row = sqlx::query("SELECT * FROM event_cache_status WHERE event_code = ?")
        .bind(event_code)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(cache_status_from_row).transpose()
}

pub async fn list_cached_events(pool: &Pool) -> StoreResult<Vec<EventCacheStatus>> {
    let rows = sqlx::query("SELECT * FROM event_cache_status ORDER BY cached_at DESC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(cache_status_from_row).collect()
}

/// Delete an event's cached records and its status row. Returns records deleted.
#[instrument(skip_all, fields(event_code = %event_code))]
pub async fn clear_event_cache(pool: &Pool, event_code: &str) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM cached_records WHERE event_code = ?")
        .bind(event_code)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM event_cache_status WHERE event_code = ?")
        .bind(event_code)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{enqueue, init_pool, run_migrations};
    use crate::model::EntryKind;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn replacing_records_drops_stale_rows() {
        let pool = setup_pool().await;
        let first = vec![
            ("254".to_string(), json!({"team_number": 254})),
            ("1678".to_string(), json!({"team_number": 1678})),
        ];
        assert_eq!(
            replace_cached_records(&pool, "2024casj", "teams", &first)
                .await
                .unwrap(),
            2
        );
        let second = vec![("971".to_string(), json!({"team_number": 971}))];
        assert_eq!(
            replace_cached_records(&pool, "2024casj", "teams", &second)
                .await
                .unwrap(),
            1
        );
        let teams = cached_records(&pool, "2024casj", "teams").await.unwrap();
        assert_eq!(teams, vec![json!({"team_number": 971})]);
    }

    #[tokio::test]
    async fn clear_event_cache_leaves_queue_alone() {
        let pool = setup_pool().await;
        enqueue(&pool, EntryKind::Pit, &json!({"team": 1})).await.unwrap();
        replace_cached_records(&pool, "2024casj", "teams", &[("1".into(), json!({}))])
            .await
            .unwrap();
        replace_cached_records(&pool, "2024cave", "teams", &[("2".into(), json!({}))])
            .await
            .unwrap();
        upsert_event_cache_status(
            &pool,
            &EventCacheStatus {
                event_code: "2024casj".into(),
                year: 2024,
                cached_at: Utc::now(),
                teams_count: 1,
                pit_entries_count: 0,
                match_entries_count: 0,
                pages_cached: true,
                session_cached: true,
                schedules_cached: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(clear_event_cache(&pool, "2024casj").await.unwrap(), 1);
        assert!(get_event_cache_status(&pool, "2024casj")
            .await
            .unwrap()
            .is_none());
        assert_eq!(cached_records(&pool, "2024cave", "teams").await.unwrap().len(), 1);
        assert_eq!(crate::db::count(&pool, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pages_and_session_upsert() {
        let pool = setup_pool().await;
        upsert_page(&pool, "/scout", "<html>v1</html>").await.unwrap();
        upsert_page(&pool, "/scout", "<html>v2</html>").await.unwrap();
        assert_eq!(
            get_page(&pool, "/scout").await.unwrap().as_deref(),
            Some("<html>v2</html>")
        );

        assert!(get_session(&pool).await.unwrap().is_none());
        store_session(&pool, &json!({"user": "ada", "role": "admin"}))
            .await
            .unwrap();
        assert_eq!(get_session(&pool).await.unwrap().unwrap()["user"], "ada");
    }
}
