//! Event cache pipeline.
//!
//! Downloads everything needed to work an event offline as a fixed sequence
//! of independent, best-effort steps. Each step reports
//! `pending -> loading -> success | error | skipped` through a callback.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool, StoreResult};
use crate::model::{CacheMode, CacheStep, CacheStepId, CacheStepStatus, EventCacheStatus};
use crate::remote::EventDataService;

const PAGE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheRole {
    Scout,
    Admin,
}

impl CacheRole {
    pub fn parse_role(s: &str) -> Option<Self> {
        match s {
            "scout" => Some(CacheRole::Scout),
            "admin" => Some(CacheRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheContext {
    pub event_code: String,
    pub year: i32,
    pub role: CacheRole,
    /// App page paths to keep for offline navigation.
    pub pages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheResult {
    pub success: bool,
    pub steps: Vec<CacheStep>,
    /// Status row written by a `full` run.
    pub status: Option<EventCacheStatus>,
}

enum StepOutcome {
    Cached { count: i64, detail: String },
    Skipped(String),
}

#[derive(Default)]
struct Totals {
    session: bool,
    pages: bool,
    teams: i64,
    schedule: bool,
    scouting_schedule: bool,
    pit_entries: i64,
    match_entries: i64,
}

/// Key for a cached record: the first identifying field present, else its index.
pub fn record_key(record: &Value, index: usize) -> String {
    for field in ["id", "key", "team_number", "match_number"] {
        match record.get(field) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    index.to_string()
}

async fn store_records(
    pool: &Pool,
    event_code: &str,
    step: CacheStepId,
    records: Vec<Value>,
) -> Result<StepOutcome> {
    let mut seen = HashSet::new();
    let keyed: Vec<(String, Value)> = records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let mut key = record_key(&record, i);
            // Repeated keys (e.g. qualification and playoff match 1) must not overwrite.
            if !seen.insert(key.clone()) {
                key = format!("{}#{}", key, i);
                seen.insert(key.clone());
            }
            (key, record)
        })
        .collect();
    let count = db::replace_cached_records(pool, event_code, step.as_str(), &keyed).await?;
    Ok(StepOutcome::Cached {
        count,
        detail: format!("{} records", count),
    })
}

async fn cache_pages(pool: &Pool, service: &dyn EventDataService, paths: &[String]) -> Result<StepOutcome> {
    if paths.is_empty() {
        return Ok(StepOutcome::Cached {
            count: 0,
            detail: "no pages configured".into(),
        });
    }
    let fetched: Vec<(&String, Result<String>)> = stream::iter(paths)
        .map(|path| async move { (path, service.fetch_page(path).await) })
        .buffer_unordered(PAGE_CONCURRENCY)
        .collect()
        .await;

    let mut stored = 0i64;
    let mut failed = Vec::new();
    for (path, body) in fetched {
        match body {
            Ok(body) => {
                db::upsert_page(pool, path, &body).await?;
                stored += 1;
            }
            Err(err) => {
                warn!(path = %path, error = %err, "page fetch failed");
                failed.push(path.as_str());
            }
        }
    }
    if !failed.is_empty() {
        failed.sort_unstable();
        return Err(anyhow!(
            "{} of {} pages failed: {}",
            failed.len(),
            paths.len(),
            failed.join(", ")
        ));
    }
    Ok(StepOutcome::Cached {
        count: stored,
        detail: format!("{} pages", stored),
    })
}

async fn run_step(
    pool: &Pool,
    service: &dyn EventDataService,
    ctx: &CacheContext,
    step: CacheStepId,
) -> Result<StepOutcome> {
    let event = ctx.event_code.as_str();
    match step {
        CacheStepId::Session => {
            let session = service.fetch_session().await?;
            db::store_session(pool, &session).await?;
            Ok(StepOutcome::Cached {
                count: 1,
                detail: "session stored".into(),
            })
        }
        CacheStepId::Pages => cache_pages(pool, service, &ctx.pages).await,
        CacheStepId::Teams => store_records(pool, event, step, service.fetch_teams(event).await?).await,
        CacheStepId::Schedule => {
            store_records(pool, event, step, service.fetch_schedule(event).await?).await
        }
        CacheStepId::ScoutingSchedule => {
            let blocks = service.fetch_scouting_schedule(event).await?;
            store_records(pool, event, step, blocks).await
        }
        CacheStepId::ScoutRoster => {
            if ctx.role != CacheRole::Admin {
                return Ok(StepOutcome::Skipped("requires admin role".into()));
            }
            store_records(pool, event, step, service.fetch_scout_roster(event).await?).await
        }
        CacheStepId::PitEntries => {
            let entries = service.fetch_pit_entries(event, ctx.year).await?;
            store_records(pool, event, step, entries).await
        }
        CacheStepId::MatchEntries => {
            let entries = service.fetch_match_entries(event, ctx.year).await?;
            store_records(pool, event, step, entries).await
        }
    }
}

/// Run every step of `mode` in order, reporting each transition to `on_step`.
///
/// A failing step never stops the steps after it. `success` is false iff any
/// step ended in `error`. A `full` run overwrites the event's status row.
#[instrument(skip_all, fields(event_code = %ctx.event_code, mode = mode.as_str()))]
pub async fn run_event_cache<F>(
    pool: &Pool,
    service: &dyn EventDataService,
    mode: CacheMode,
    ctx: &CacheContext,
    mut on_step: F,
) -> CacheResult
where
    F: FnMut(&CacheStep),
{
    let mut steps: Vec<CacheStep> = CacheStepId::ALL
        .iter()
        .filter(|id| id.in_mode(mode))
        .map(|id| CacheStep::new(*id))
        .collect();
    for step in &steps {
        on_step(step);
    }

    let mut totals = Totals::default();
    for step in steps.iter_mut() {
        step.status = CacheStepStatus::Loading;
        on_step(step);

        match run_step(pool, service, ctx, step.id).await {
            Ok(StepOutcome::Cached { count, detail }) => {
                step.status = CacheStepStatus::Success;
                step.detail = Some(detail);
                match step.id {
                    CacheStepId::Session => totals.session = true,
                    CacheStepId::Pages => totals.pages = true,
                    CacheStepId::Teams => totals.teams = count,
                    CacheStepId::Schedule => totals.schedule = true,
                    CacheStepId::ScoutingSchedule => totals.scouting_schedule = true,
                    CacheStepId::PitEntries => totals.pit_entries = count,
                    CacheStepId::MatchEntries => totals.match_entries = count,
                    CacheStepId::ScoutRoster => {}
                }
            }
            Ok(StepOutcome::Skipped(reason)) => {
                step.status = CacheStepStatus::Skipped;
                step.detail = Some(reason);
            }
            Err(err) => {
                error!(step = step.id.as_str(), error = %err, "cache step failed");
                step.status = CacheStepStatus::Error;
                step.error = Some(format!("{:#}", err));
            }
        }
        on_step(step);
    }

    let success = steps.iter().all(|s| s.status != CacheStepStatus::Error);
    let status = if mode == CacheMode::Full {
        let status = EventCacheStatus {
            event_code: ctx.event_code.clone(),
            year: ctx.year,
            cached_at: Utc::now(),
            teams_count: totals.teams,
            pit_entries_count: totals.pit_entries,
            match_entries_count: totals.match_entries,
            pages_cached: totals.pages,
            session_cached: totals.session,
            schedules_cached: totals.schedule && totals.scouting_schedule,
        };
        match db::upsert_event_cache_status(pool, &status).await {
            Ok(()) => Some(status),
            Err(err) => {
                error!(error = %err, "failed to write event cache status");
                None
            }
        }
    } else {
        None
    };

    info!(success, "event cache run finished");
    CacheResult {
        success,
        steps,
        status,
    }
}

/// Remove an event's cached records and status. The sync queue is not touched.
pub async fn clear_event_cache(pool: &Pool, event_code: &str) -> StoreResult<u64> {
    let deleted = db::clear_event_cache(pool, event_code).await?;
    info!(event_code, deleted, "event cache cleared");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryKind;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct FakeEventData {
        fail_schedule: bool,
        fail_page: Option<&'static str>,
    }

    #[async_trait]
    impl EventDataService for FakeEventData {
        async fn fetch_session(&self) -> Result<Value> {
            Ok(json!({ "user": "scout1" }))
        }
        async fn fetch_page(&self, path: &str) -> Result<String> {
            if self.fail_page == Some(path) {
                return Err(anyhow!("404"));
            }
            Ok(format!("<html>{}</html>", path))
        }
        async fn fetch_teams(&self, _event_code: &str) -> Result<Vec<Value>> {
            Ok(vec![json!({ "team_number": 254 }), json!({ "team_number": 1678 })])
        }
        async fn fetch_schedule(&self, _event_code: &str) -> Result<Vec<Value>> {
            if self.fail_schedule {
                return Err(anyhow!("schedule endpoint returned 500"));
            }
            Ok(vec![json!({ "match_number": 1 })])
        }
        async fn fetch_scouting_schedule(&self, _event_code: &str) -> Result<Vec<Value>> {
            Ok(vec![json!({ "id": "block-1" })])
        }
        async fn fetch_scout_roster(&self, _event_code: &str) -> Result<Vec<Value>> {
            Ok(vec![json!({ "id": 9, "name": "Ada" })])
        }
        async fn fetch_pit_entries(&self, _event_code: &str, _year: i32) -> Result<Vec<Value>> {
            Ok(vec![json!({ "id": 1 }), json!({ "id": 2 }), json!({ "id": 3 })])
        }
        async fn fetch_match_entries(&self, _event_code: &str, _year: i32) -> Result<Vec<Value>> {
            Ok(vec![json!({ "id": 10 })])
        }
    }

    async fn pool() -> Pool {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    fn ctx(role: CacheRole) -> CacheContext {
        CacheContext {
            event_code: "2024casj".into(),
            year: 2024,
            role,
            pages: vec!["/".into(), "/scout".into()],
        }
    }

    fn status_of(result: &CacheResult, id: CacheStepId) -> CacheStepStatus {
        result.steps.iter().find(|s| s.id == id).unwrap().status
    }

    #[test]
    fn record_keys_prefer_identifying_fields() {
        assert_eq!(record_key(&json!({ "id": 7, "key": "x" }), 0), "7");
        assert_eq!(record_key(&json!({ "key": "frc254" }), 0), "frc254");
        assert_eq!(record_key(&json!({ "match_number": 12 }), 0), "12");
        assert_eq!(record_key(&json!({ "name": "n" }), 4), "4");
    }

    #[tokio::test]
    async fn repeated_keys_are_all_kept() {
        let pool = pool().await;
        let records = vec![
            json!({ "match_number": 1, "comp_level": "qm" }),
            json!({ "match_number": 1, "comp_level": "sf" }),
            json!({ "match_number": 2, "comp_level": "qm" }),
        ];
        let outcome = store_records(&pool, "2024casj", CacheStepId::Schedule, records)
            .await
            .unwrap();
        let StepOutcome::Cached { count, .. } = outcome else {
            panic!("records should be cached");
        };
        assert_eq!(count, 3);
        let cached = db::cached_records(&pool, "2024casj", "schedule").await.unwrap();
        assert_eq!(cached.len(), 3);
        assert_eq!(cached[1]["comp_level"], "sf");
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_siblings() {
        let pool = pool().await;
        let service = FakeEventData {
            fail_schedule: true,
            ..Default::default()
        };
        let result = run_event_cache(&pool, &service, CacheMode::Scout, &ctx(CacheRole::Admin), |_| {}).await;

        assert!(!result.success);
        assert_eq!(result.steps.len(), 6);
        for step in &result.steps {
            let expected = if step.id == CacheStepId::Schedule {
                CacheStepStatus::Error
            } else {
                CacheStepStatus::Success
            };
            assert_eq!(step.status, expected, "step {}", step.id.as_str());
        }
        assert!(result.status.is_none());
        assert!(db::get_event_cache_status(&pool, "2024casj").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roster_is_skipped_for_scouts() {
        let pool = pool().await;
        let result = run_event_cache(
            &pool,
            &FakeEventData::default(),
            CacheMode::Scout,
            &ctx(CacheRole::Scout),
            |_| {},
        )
        .await;
        assert!(result.success);
        assert_eq!(status_of(&result, CacheStepId::ScoutRoster), CacheStepStatus::Skipped);
        assert!(db::cached_records(&pool, "2024casj", "scout-roster")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn callback_sees_every_transition_in_order() {
        let pool = pool().await;
        let mut seen = Vec::new();
        run_event_cache(
            &pool,
            &FakeEventData::default(),
            CacheMode::Scout,
            &ctx(CacheRole::Admin),
            |step| seen.push((step.id, step.status)),
        )
        .await;

        assert_eq!(seen.len(), 6 * 3);
        assert!(seen[..6].iter().all(|(_, s)| *s == CacheStepStatus::Pending));
        assert_eq!(seen[6], (CacheStepId::Session, CacheStepStatus::Loading));
        assert_eq!(seen[7], (CacheStepId::Session, CacheStepStatus::Success));
        assert_eq!(seen[8], (CacheStepId::Pages, CacheStepStatus::Loading));
        assert_eq!(seen.last(), Some(&(CacheStepId::ScoutRoster, CacheStepStatus::Success)));
    }

    #[tokio::test]
    async fn failed_page_marks_pages_step_error() {
        let pool = pool().await;
        let service = FakeEventData {
            fail_page: Some("/scout"),
            ..Default::default()
        };
        let result = run_event_cache(&pool, &service, CacheMode::Scout, &ctx(CacheRole::Scout), |_| {}).await;
        let pages = result.steps.iter().find(|s| s.id == CacheStepId::Pages).unwrap();
        assert_eq!(pages.status, CacheStepStatus::Error);
        assert!(pages.error.as_deref().unwrap().contains("/scout"));
        assert_eq!(db::get_page(&pool, "/").await.unwrap().as_deref(), Some("<html>/</html>"));
    }

    #[tokio::test]
    async fn full_run_writes_status_and_clear_keeps_queue() {
        let pool = pool().await;
        let queued = db::enqueue(&pool, EntryKind::Pit, &json!({ "team": 254 }))
            .await
            .unwrap();

        let result = run_event_cache(
            &pool,
            &FakeEventData::default(),
            CacheMode::Full,
            &ctx(CacheRole::Admin),
            |_| {},
        )
        .await;
        assert!(result.success);
        assert_eq!(result.steps.len(), 8);

        let status = db::get_event_cache_status(&pool, "2024casj").await.unwrap().unwrap();
        assert_eq!(status.teams_count, 2);
        assert_eq!(status.pit_entries_count, 3);
        assert_eq!(status.match_entries_count, 1);
        assert!(status.pages_cached && status.session_cached && status.schedules_cached);
        assert_eq!(result.status.as_ref(), Some(&status));

        let deleted = clear_event_cache(&pool, "2024casj").await.unwrap();
        assert_eq!(deleted, 2 + 1 + 1 + 1 + 3 + 1);
        assert!(db::get_event_cache_status(&pool, "2024casj").await.unwrap().is_none());
        assert!(db::get_entry(&pool, &queued).await.unwrap().is_some());
    }
}
