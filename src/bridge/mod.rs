//! Background sync bridge.
//!
//! Lets the queue drain without a foreground caller: a registrar arms a
//! one-shot "connectivity restored" callback, the watcher fires it, and the
//! bridge re-enters the same [`SyncOrchestrator`] pass the foreground uses.
//! Outcomes become user notifications and are relayed to subscribers.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::error::SyncError;
use crate::model::SyncResult;
use crate::remote::ConnectivityProbe;
use crate::sync::SyncOrchestrator;

pub const SYNC_TAG: &str = "sync-queue";
const QUEUE_ROUTE: &str = "/queue";

/// User-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Persistent until the user acts on it.
    pub require_interaction: bool,
    /// Opaque payload routed back into the app on click.
    pub data: Value,
}

impl Notification {
    fn queue(title: &str, body: String, require_interaction: bool) -> Self {
        Self {
            title: title.to_string(),
            body,
            require_interaction,
            data: json!({ "url": QUEUE_ROUTE }),
        }
    }
}

/// In-app route for a clicked notification payload.
pub fn notification_route(data: &Value) -> &str {
    data.get("url")
        .and_then(Value::as_str)
        .filter(|url| url.starts_with('/'))
        .unwrap_or("/")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: Notification) -> Result<()>;
}

/// Request-for-future-callback primitive. Best effort: the platform may
/// delay, coalesce or drop the callback.
#[async_trait]
pub trait SyncRegistrar: Send + Sync {
    async fn register(&self, tag: &str) -> Result<()>;
}

/// Registrar for the daemon: `register` arms a one-shot tag that the
/// connectivity watcher consumes.
#[derive(Debug, Default)]
pub struct PollingRegistrar {
    armed: Mutex<Option<String>>,
}

impl PollingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    pub fn take_armed(&self) -> Option<String> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SyncRegistrar for PollingRegistrar {
    async fn register(&self, tag: &str) -> Result<()> {
        *self.lock() = Some(tag.to_string());
        Ok(())
    }
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn show(&self, n: Notification) -> Result<()> {
        if n.require_interaction {
            warn!(title = %n.title, route = notification_route(&n.data), "{}", n.body);
        } else {
            info!(title = %n.title, route = notification_route(&n.data), "{}", n.body);
        }
        Ok(())
    }
}

/// Event relayed to open foreground views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeEvent {
    SyncComplete(SyncResult),
    SyncFailed { message: String },
}

/// Manual triggers sent from a foreground view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SyncNow,
    RetryFailed,
}

pub struct BackgroundSyncBridge {
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Arc<dyn Notifier>,
    registrar: Arc<dyn SyncRegistrar>,
    probe: Arc<dyn ConnectivityProbe>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BackgroundSyncBridge {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        notifier: Arc<dyn Notifier>,
        registrar: Arc<dyn SyncRegistrar>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            orchestrator,
            notifier,
            registrar,
            probe,
            events,
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Ask to be called back when connectivity returns. Failure is logged, never raised.
    pub async fn request_background_sync(&self) -> bool {
        match self.registrar.register(SYNC_TAG).await {
            Ok(()) => {
                debug!("background sync registered");
                true
            }
            Err(err) => {
                warn!(error = %err, "background sync registration failed");
                false
            }
        }
    }

    /// Platform callback entry point.
    ///
    /// Returns `Ok(None)` when the tag is unknown or the remote is still
    /// unreachable; in the latter case the queue is left as it was and the
    /// callback is re-armed.
    #[instrument(skip_all, fields(tag = %tag))]
    pub async fn handle_sync_event(&self, tag: &str) -> Result<Option<SyncResult>, SyncError> {
        if tag != SYNC_TAG {
            debug!("ignoring unknown sync tag");
            return Ok(None);
        }
        if !self.probe.is_online().await {
            info!("still offline; deferring background sync");
            self.request_background_sync().await;
            return Ok(None);
        }
        let outcome = self.orchestrator.sync_pending_entries().await;
        self.report(outcome).await.map(Some)
    }

    pub async fn handle_message(&self, message: ClientMessage) -> Result<SyncResult, SyncError> {
        debug!(?message, "client message");
        let outcome = match message {
            ClientMessage::SyncNow => self.orchestrator.sync_pending_entries().await,
            ClientMessage::RetryFailed => self.orchestrator.retry_failed_entries().await,
        };
        self.report(outcome).await
    }

    async fn report(
        &self,
        outcome: Result<SyncResult, SyncError>,
    ) -> Result<SyncResult, SyncError> {
        match outcome {
            Ok(result) => {
                if let Some(notification) = completion_notification(&result) {
                    self.notify(notification).await;
                }
                // No subscribers is fine.
                let _ = self.events.send(BridgeEvent::SyncComplete(result.clone()));
                Ok(result)
            }
            Err(SyncError::AlreadyInProgress) => {
                debug!("a sync pass is already running");
                Err(SyncError::AlreadyInProgress)
            }
            Err(err) => {
                let message = err.to_string();
                self.notify(Notification::queue("Sync failed", message.clone(), true))
                    .await;
                let _ = self.events.send(BridgeEvent::SyncFailed { message });
                Err(err)
            }
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifier.show(notification).await {
            warn!(error = %err, "failed to show notification");
        }
    }
}

fn completion_notification(result: &SyncResult) -> Option<Notification> {
    if result.failed_count > 0 {
        Some(Notification::queue(
            "Sync issues",
            format!("{} entries failed to sync", result.failed_count),
            true,
        ))
    } else if result.synced_count > 0 {
        Some(Notification::queue(
            "Sync complete",
            format!("Synced {} entries", result.synced_count),
            false,
        ))
    } else {
        None
    }
}

/// Polls connectivity and fires the bridge when the registrar is armed, or
/// on an offline to online transition while auto sync is enabled.
pub struct ConnectivityWatcher {
    bridge: Arc<BackgroundSyncBridge>,
    registrar: Arc<PollingRegistrar>,
    was_online: Option<bool>,
}

impl ConnectivityWatcher {
    pub fn new(bridge: Arc<BackgroundSyncBridge>, registrar: Arc<PollingRegistrar>) -> Self {
        Self {
            bridge,
            registrar,
            was_online: None,
        }
    }

    /// One poll. Returns true if a sync pass was attempted.
    pub async fn tick(&mut self) -> bool {
        let online = self.bridge.probe.is_online().await;
        let came_back = online && self.was_online == Some(false);
        self.was_online = Some(online);
        if !online {
            return false;
        }

        let fire = if self.registrar.take_armed().is_some() {
            true
        } else if came_back {
            match self.bridge.orchestrator.config().await {
                Ok(config) => config.auto_sync_enabled,
                Err(err) => {
                    warn!(error = %err, "could not read sync config");
                    false
                }
            }
        } else {
            false
        };
        if !fire {
            return false;
        }

        info!(came_back, "connectivity available; running background sync");
        if let Err(err) = self.bridge.handle_sync_event(SYNC_TAG).await {
            debug!(error = %err, "background sync did not complete");
        }
        true
    }

    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

/// Spawn a [`ConnectivityWatcher`] polling every `interval`.
pub fn run_connectivity_watcher(
    bridge: Arc<BackgroundSyncBridge>,
    registrar: Arc<PollingRegistrar>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(ConnectivityWatcher::new(bridge, registrar).run(interval))
}
