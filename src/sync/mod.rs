//! Sync orchestrator: walks pending queue entries, submits them, and rewrites
//! queue state from the outcome.
//!
//! At most one pass runs per orchestrator at a time. Entries are claimed with
//! an atomic `pending -> syncing` update before submission, so a second
//! process working on the same store skips entries already in flight.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::{EntryKind, EntryStatus, SyncConfig, SyncConfigUpdate, SyncResult};
use crate::remote::{SubmissionService, SubmitError};

pub mod retry;

pub use retry::{RetryPolicy, RetryScheduler};

pub type SyncListener = Arc<dyn Fn(&SyncResult) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of the foreground write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Stored locally; a later pass delivers it.
    Queued { id: String },
    /// Delivered immediately.
    Synced { id: String, remote_id: i64 },
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard(flag))
            .map_err(|_| SyncError::AlreadyInProgress)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    pool: Pool,
    remote: Arc<dyn SubmissionService>,
    defaults: SyncConfig,
    busy: AtomicBool,
    listeners: Mutex<Vec<(ListenerId, SyncListener)>>,
    next_listener: AtomicU64,
    retries: RetryScheduler,
    stale_after: Duration,
}

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

impl SyncOrchestrator {
    pub fn new(pool: Pool, remote: Arc<dyn SubmissionService>, defaults: SyncConfig) -> Self {
        Self {
            pool,
            remote,
            defaults,
            busy: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            retries: RetryScheduler::new(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// How long an entry may sit in `syncing` before a pass requeues it.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn retry_scheduler(&self) -> &RetryScheduler {
        &self.retries
    }

    pub fn is_syncing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn config(&self) -> Result<SyncConfig, SyncError> {
        Ok(db::get_or_init_config(&self.pool, &self.defaults).await?)
    }

    pub async fn update_config(&self, update: &SyncConfigUpdate) -> Result<SyncConfig, SyncError> {
        Ok(db::update_config(&self.pool, &self.defaults, update).await?)
    }

    /// Foreground write path: queue while offline, otherwise try the server first.
    ///
    /// A structural rejection is returned to the caller and nothing is stored.
    #[instrument(skip_all, fields(kind = kind.as_str(), online = online))]
    pub async fn save_entry(
        &self,
        kind: EntryKind,
        data: &Value,
        online: bool,
    ) -> Result<SaveOutcome, SyncError> {
        if !online {
            let id = db::enqueue(&self.pool, kind, data).await?;
            return Ok(SaveOutcome::Queued { id });
        }
        match self.remote.submit(kind, data).await {
            Ok(remote_id) => {
                let id = db::insert_synced(&self.pool, kind, data, remote_id).await?;
                info!(id = %id, remote_id, "entry submitted directly");
                Ok(SaveOutcome::Synced { id, remote_id })
            }
            Err(SubmitError::Rejected(message)) => {
                warn!(%message, "entry rejected by server");
                Err(SyncError::Rejected { id: None, message })
            }
            Err(SubmitError::Transient(message)) => {
                warn!(%message, "direct submission failed; queueing");
                let id = db::enqueue(&self.pool, kind, data).await?;
                Ok(SaveOutcome::Queued { id })
            }
        }
    }

    /// Run one pass over every pending entry.
    ///
    /// Fails with [`SyncError::AlreadyInProgress`] without touching the store
    /// if another pass is running on this orchestrator.
    pub async fn sync_pending_entries(&self) -> Result<SyncResult, SyncError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.run_and_record().await
    }

    /// Move every retryable `error` entry back to `pending` and run a pass.
    /// Entries the server rejected stay parked.
    pub async fn retry_failed_entries(&self) -> Result<SyncResult, SyncError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let reset = db::reset_errors(&self.pool).await?;
        info!(reset, "failed entries requeued");
        self.run_and_record().await
    }

    async fn run_and_record(&self) -> Result<SyncResult, SyncError> {
        match self.run_pass().await {
            Ok(result) => {
                db::append_sync_log(&self.pool, &result).await?;
                info!(
                    synced = result.synced_count,
                    failed = result.failed_count,
                    "sync pass finished"
                );
                self.notify_listeners(&result);
                Ok(result)
            }
            Err(err) => {
                error!(error = %err, "sync pass aborted");
                let result = SyncResult::failed(err.to_string());
                if let Err(log_err) = db::append_sync_log(&self.pool, &result).await {
                    warn!(error = %log_err, "could not record failed sync pass");
                }
                Err(err)
            }
        }
    }

    #[instrument(skip_all)]
    async fn run_pass(&self) -> Result<SyncResult, SyncError> {
        let config = self.config().await?;
        self.recover_stale(self.stale_after).await?;
        let pending = db::get_pending(&self.pool).await?;
        let batch_size = usize::try_from(config.batch_size.max(1)).unwrap_or(usize::MAX);
        info!(pending = pending.len(), batch_size, "starting sync pass");

        let mut synced = 0u32;
        let mut failed = 0u32;
        let mut errors = Vec::new();
        for (n, batch) in pending.chunks(batch_size).enumerate() {
            debug!(batch = n, size = batch.len(), "processing batch");
            for entry in batch {
                match self.process_entry(&entry.id, &config).await {
                    Ok(Some(_)) => synced += 1,
                    Ok(None) => {}
                    Err(err @ SyncError::Store(_)) => return Err(err),
                    Err(err) => {
                        failed += 1;
                        errors.push(err.log_message());
                    }
                }
            }
        }
        Ok(SyncResult::new(synced, failed, errors))
    }

    /// Deliver one entry outside of a pass, using the current config.
    ///
    /// Returns `Ok(None)` if the entry is not pending (already claimed, synced, or gone).
    pub async fn sync_single_entry(&self, id: &str) -> Result<Option<i64>, SyncError> {
        let config = self.config().await?;
        self.process_entry(id, &config).await
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn process_entry(&self, id: &str, config: &SyncConfig) -> Result<Option<i64>, SyncError> {
        let Some(entry) = db::claim_entry(&self.pool, id).await? else {
            debug!("entry not pending; skipping");
            return Ok(None);
        };

        match self.remote.submit(entry.kind, &entry.data).await {
            Ok(remote_id) => {
                db::finish_attempt(&self.pool, id, EntryStatus::Synced, Some(remote_id), None)
                    .await?;
                self.retries.cancel(id);
                info!(remote_id, attempts = entry.attempts, "entry synced");
                Ok(Some(remote_id))
            }
            Err(SubmitError::Rejected(message)) => {
                let note = format!("rejected: {}", message);
                db::mark_rejected(&self.pool, id, &note).await?;
                self.retries.cancel(id);
                warn!(%message, "entry rejected by server; not retrying");
                Err(SyncError::Rejected {
                    id: Some(id.to_string()),
                    message,
                })
            }
            Err(SubmitError::Transient(message)) => {
                let attempts = u32::try_from(entry.attempts).unwrap_or(u32::MAX);
                if attempts < config.max_retries {
                    db::finish_attempt(&self.pool, id, EntryStatus::Pending, None, Some(&message))
                        .await?;
                    let delay = RetryPolicy::from_config(config).next_delay(attempts);
                    self.retries.schedule(id, delay);
                    warn!(attempts, ?delay, %message, "entry failed; retry scheduled");
                } else {
                    db::finish_attempt(&self.pool, id, EntryStatus::Error, None, Some(&message))
                        .await?;
                    self.retries.cancel(id);
                    error!(attempts, %message, "entry failed; retries exhausted");
                }
                Err(SyncError::Delivery {
                    id: id.to_string(),
                    message,
                })
            }
        }
    }

    /// Run every scheduled retry that is due. Returns how many were attempted.
    pub async fn run_due_retries(&self) -> usize {
        let due = self.retries.pop_due(tokio::time::Instant::now());
        for id in &due {
            match self.sync_single_entry(id).await {
                Ok(_) => {}
                Err(err) => debug!(id = %id, error = %err, "scheduled retry failed"),
            }
        }
        due.len()
    }

    /// Drive the retry scheduler until the returned handle is aborted.
    pub fn spawn_retry_worker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.retries.wait_next(Duration::from_secs(60)).await;
                self.run_due_retries().await;
            }
        })
    }

    /// Requeue entries stuck in `syncing` whose last attempt is older than `stale_after`.
    pub async fn recover_stale(&self, stale_after: Duration) -> Result<u64, SyncError> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let moved = db::requeue_stale_syncing(&self.pool, chrono::Utc::now() - stale_after).await?;
        if moved > 0 {
            warn!(moved, "requeued entries left in syncing");
        }
        Ok(moved)
    }

    pub fn add_sync_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncResult) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_sync_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, SyncListener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_listeners(&self, result: &SyncResult) {
        let snapshot: Vec<SyncListener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
                error!("sync listener panicked");
            }
        }
    }
}
