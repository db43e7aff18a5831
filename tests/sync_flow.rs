use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use scout_sync::db;
use scout_sync::error::SyncError;
use scout_sync::model::{EntryKind, EntryStatus, SyncConfig};
use scout_sync::remote::{SubmissionService, SubmitError};
use scout_sync::sync::{SaveOutcome, SyncOrchestrator};

async fn setup_pool() -> db::Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingRemote {
    responses: Arc<Mutex<VecDeque<Result<i64, SubmitError>>>>,
    fallback: Option<Result<i64, SubmitError>>,
    calls: Arc<Mutex<Vec<(EntryKind, Value)>>>,
}

impl RecordingRemote {
    fn with_responses(responses: Vec<Result<i64, SubmitError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn always(response: Result<i64, SubmitError>) -> Self {
        Self {
            fallback: Some(response),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<(EntryKind, Value)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SubmissionService for RecordingRemote {
    async fn submit(&self, kind: EntryKind, data: &Value) -> Result<i64, SubmitError> {
        self.calls.lock().await.push((kind, data.clone()));
        let scripted = self.responses.lock().await.pop_front();
        scripted
            .or_else(|| self.fallback.clone())
            .unwrap_or(Ok(1))
    }
}

#[tokio::test]
async fn offline_capture_then_sync_then_clear() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![Ok(42)]);
    let orch = SyncOrchestrator::new(pool.clone(), Arc::new(remote.clone()), SyncConfig::default());

    let data = json!({ "team": 254, "event": "2024casj", "drivetrain": "swerve" });
    let saved = orch.save_entry(EntryKind::Pit, &data, false).await.unwrap();
    let SaveOutcome::Queued { id } = saved else {
        panic!("offline save should queue");
    };

    let pending = db::get_pending(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].status, EntryStatus::Pending);
    assert_eq!(pending[0].attempts, 0);
    assert!(remote.calls().await.is_empty());

    let result = orch.sync_pending_entries().await.unwrap();
    assert!(result.success);
    assert_eq!(result.synced_count, 1);
    assert_eq!(result.failed_count, 0);

    let entry = db::get_entry(&pool, &id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Synced);
    assert_eq!(entry.remote_id, Some(42));
    assert_eq!(entry.attempts, 1);
    assert_eq!(remote.calls().await, vec![(EntryKind::Pit, data)]);

    let logged = db::recent_sync_logs(&pool, 10).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].synced_count, 1);

    assert_eq!(db::clear_synced(&pool).await.unwrap(), 1);
    assert!(db::get_all(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn retries_exhaust_exactly_at_max_retries() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::always(Err(SubmitError::Transient("timed out".into())));
    let orch = SyncOrchestrator::new(pool.clone(), Arc::new(remote.clone()), SyncConfig::default());
    let id = db::enqueue(&pool, EntryKind::Match, &json!({ "match": 12 }))
        .await
        .unwrap();

    for attempt in 1..=3i64 {
        let result = orch.sync_pending_entries().await.unwrap();
        assert_eq!(result.failed_count, 1);
        assert!(result.errors[0].starts_with(&id));

        let entry = db::get_entry(&pool, &id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, attempt);
        let expected = if attempt < 3 {
            EntryStatus::Pending
        } else {
            EntryStatus::Error
        };
        assert_eq!(entry.status, expected, "after attempt {}", attempt);
        assert_eq!(entry.error.as_deref(), Some("timed out"));
    }
    assert!(!orch.retry_scheduler().is_scheduled(&id));

    // Parked entries are not picked up by later passes.
    let result = orch.sync_pending_entries().await.unwrap();
    assert_eq!(result.synced_count + result.failed_count, 0);
    assert_eq!(remote.calls().await.len(), 3);
}

#[tokio::test]
async fn retry_failed_never_resends_a_rejected_record() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::always(Err(SubmitError::Rejected("409: duplicate".into())));
    let orch = SyncOrchestrator::new(pool.clone(), Arc::new(remote.clone()), SyncConfig::default());
    let id = db::enqueue(&pool, EntryKind::Match, &json!({ "match": 4, "team": 971 }))
        .await
        .unwrap();

    let result = orch.sync_pending_entries().await.unwrap();
    assert_eq!(result.failed_count, 1);
    assert!(result.errors[0].contains("rejected: 409: duplicate"));

    for _ in 0..2 {
        let retried = orch.retry_failed_entries().await.unwrap();
        assert!(retried.success);
        assert_eq!(retried.synced_count, 0);
    }
    assert_eq!(remote.calls().await.len(), 1);

    let entry = db::get_entry(&pool, &id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(entry.rejected);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn retry_failed_gives_parked_entries_another_attempt() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![
        Err(SubmitError::Transient("503".into())),
        Ok(77),
    ]);
    let orch = SyncOrchestrator::new(
        pool.clone(),
        Arc::new(remote.clone()),
        SyncConfig {
            max_retries: 1,
            ..SyncConfig::default()
        },
    );
    let id = db::enqueue(&pool, EntryKind::Pit, &json!({})).await.unwrap();

    orch.sync_pending_entries().await.unwrap();
    assert_eq!(
        db::get_entry(&pool, &id).await.unwrap().unwrap().status,
        EntryStatus::Error
    );

    let result = orch.retry_failed_entries().await.unwrap();
    assert!(result.success);
    assert_eq!(result.synced_count, 1);

    let entry = db::get_entry(&pool, &id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Synced);
    assert_eq!(entry.remote_id, Some(77));
    assert_eq!(entry.attempts, 2);
    assert!(entry.error.is_none());
}

struct GatedRemote {
    entered: Notify,
    release: Notify,
    calls: Mutex<usize>,
}

#[async_trait::async_trait]
impl SubmissionService for GatedRemote {
    async fn submit(&self, _kind: EntryKind, _data: &Value) -> Result<i64, SubmitError> {
        *self.calls.lock().await += 1;
        self.entered.notify_one();
        self.release.notified().await;
        Ok(9)
    }
}

#[tokio::test]
async fn concurrent_pass_is_refused_without_submitting() {
    let pool = setup_pool().await;
    let remote = Arc::new(GatedRemote {
        entered: Notify::new(),
        release: Notify::new(),
        calls: Mutex::new(0),
    });
    let orch = Arc::new(SyncOrchestrator::new(
        pool.clone(),
        remote.clone(),
        SyncConfig::default(),
    ));
    db::enqueue(&pool, EntryKind::Pit, &json!({})).await.unwrap();

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.sync_pending_entries().await })
    };
    remote.entered.notified().await;
    assert!(orch.is_syncing());

    let second = orch.sync_pending_entries().await;
    assert!(matches!(second, Err(SyncError::AlreadyInProgress)));
    assert_eq!(*remote.calls.lock().await, 1);

    remote.release.notify_one();
    let result = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.synced_count, 1);
    assert!(!orch.is_syncing());
    assert_eq!(db::recent_sync_logs(&pool, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claimed_entries_are_skipped_by_other_passes() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let orch = SyncOrchestrator::new(pool.clone(), Arc::new(remote.clone()), SyncConfig::default());
    let a = db::enqueue(&pool, EntryKind::Pit, &json!({ "n": 1 })).await.unwrap();
    let b = db::enqueue(&pool, EntryKind::Pit, &json!({ "n": 2 })).await.unwrap();

    // Another context holds `a`.
    assert!(db::claim_entry(&pool, &a).await.unwrap().is_some());

    let result = orch.sync_pending_entries().await.unwrap();
    assert_eq!(result.synced_count, 1);
    assert_eq!(remote.calls().await, vec![(EntryKind::Pit, json!({ "n": 2 }))]);
    assert_eq!(
        db::get_entry(&pool, &b).await.unwrap().unwrap().status,
        EntryStatus::Synced
    );
    assert_eq!(
        db::get_entry(&pool, &a).await.unwrap().unwrap().status,
        EntryStatus::Syncing
    );
    assert!(orch.sync_single_entry(&a).await.unwrap().is_none());
}

#[tokio::test]
async fn queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/queue.db", dir.path().display());

    let (kept, synced, in_flight) = {
        let pool = db::init_pool(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let kept = db::enqueue(&pool, EntryKind::Match, &json!({ "match": 3, "auto": 12 }))
            .await
            .unwrap();
        let synced = db::enqueue(&pool, EntryKind::Pit, &json!({ "team": 1678 }))
            .await
            .unwrap();
        db::update_status(&pool, &synced, EntryStatus::Synced, Some(5), None)
            .await
            .unwrap();
        let in_flight = db::enqueue(&pool, EntryKind::Pit, &json!({ "team": 971 }))
            .await
            .unwrap();
        db::claim_entry(&pool, &in_flight).await.unwrap();
        let snapshot = db::get_entry(&pool, &kept).await.unwrap().unwrap();
        pool.close().await;
        (snapshot, synced, in_flight)
    };

    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    assert_eq!(db::get_all(&pool).await.unwrap().len(), 3);
    assert_eq!(db::get_entry(&pool, &kept.id).await.unwrap(), Some(kept));
    assert_eq!(
        db::get_entry(&pool, &synced).await.unwrap().unwrap().remote_id,
        Some(5)
    );

    let orch = SyncOrchestrator::new(
        pool.clone(),
        Arc::new(RecordingRemote::default()),
        SyncConfig::default(),
    );
    assert_eq!(orch.recover_stale(Duration::ZERO).await.unwrap(), 1);
    let recovered = db::get_entry(&pool, &in_flight).await.unwrap().unwrap();
    assert_eq!(recovered.status, EntryStatus::Pending);
    assert_eq!(recovered.attempts, 1);
}

#[tokio::test]
async fn persisted_config_drives_passes() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::always(Err(SubmitError::Transient("down".into())));
    let orch = SyncOrchestrator::new(pool.clone(), Arc::new(remote), SyncConfig::default());
    let updated = orch
        .update_config(&scout_sync::model::SyncConfigUpdate {
            max_retries: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.max_retries, 1);
    assert_eq!(updated.batch_size, SyncConfig::default().batch_size);

    let id = db::enqueue(&pool, EntryKind::Pit, &json!({})).await.unwrap();
    orch.sync_pending_entries().await.unwrap();
    assert_eq!(
        db::get_entry(&pool, &id).await.unwrap().unwrap().status,
        EntryStatus::Error
    );
}
