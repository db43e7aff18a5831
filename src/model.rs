use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain record kinds accepted by the remote submission service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Pit,
    Match,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Pit => "pit",
            EntryKind::Match => "match",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "pit" => Some(EntryKind::Pit),
            "match" => Some(EntryKind::Match),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Syncing => "syncing",
            EntryStatus::Synced => "synced",
            EntryStatus::Error => "error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "syncing" => Some(EntryStatus::Syncing),
            "synced" => Some(EntryStatus::Synced),
            "error" => Some(EntryStatus::Error),
            _ => None,
        }
    }
}

/// A domain record waiting to be delivered to the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub remote_id: Option<i64>,
    pub error: Option<String>,
    /// Refused by the server; excluded from retries of failed entries.
    #[serde(default)]
    pub rejected: bool,
}

/// Outcome of one synchronization pass. Appended to the sync log, never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub synced_count: u32,
    pub failed_count: u32,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub fn new(synced_count: u32, failed_count: u32, errors: Vec<String>) -> Self {
        Self {
            success: failed_count == 0,
            synced_count,
            failed_count,
            errors,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            synced_count: 0,
            failed_count: 0,
            errors: vec![message.into()],
            timestamp: Utc::now(),
        }
    }
}

/// Process-wide sync tuning, persisted as a single row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub batch_size: u32,
    pub auto_sync_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
            batch_size: 10,
            auto_sync_enabled: true,
        }
    }
}

/// Partial update applied on top of the stored [`SyncConfig`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigUpdate {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub batch_size: Option<u32>,
    pub auto_sync_enabled: Option<bool>,
}

impl SyncConfigUpdate {
    pub fn apply(&self, base: SyncConfig) -> SyncConfig {
        SyncConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            auto_sync_enabled: self.auto_sync_enabled.unwrap_or(base.auto_sync_enabled),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub error: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.syncing + self.synced + self.error
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Scout,
    Full,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Scout => "scout",
            CacheMode::Full => "full",
        }
    }
}

/// Steps of the event cache pipeline, declared in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStepId {
    Session,
    Pages,
    Teams,
    Schedule,
    ScoutingSchedule,
    ScoutRoster,
    PitEntries,
    MatchEntries,
}

impl CacheStepId {
    pub const ALL: [CacheStepId; 8] = [
        CacheStepId::Session,
        CacheStepId::Pages,
        CacheStepId::Teams,
        CacheStepId::Schedule,
        CacheStepId::ScoutingSchedule,
        CacheStepId::ScoutRoster,
        CacheStepId::PitEntries,
        CacheStepId::MatchEntries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStepId::Session => "session",
            CacheStepId::Pages => "pages",
            CacheStepId::Teams => "teams",
            CacheStepId::Schedule => "schedule",
            CacheStepId::ScoutingSchedule => "scouting-schedule",
            CacheStepId::ScoutRoster => "scout-roster",
            CacheStepId::PitEntries => "pit-entries",
            CacheStepId::MatchEntries => "match-entries",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CacheStepId::Session => "Auth session",
            CacheStepId::Pages => "App pages",
            CacheStepId::Teams => "Team roster",
            CacheStepId::Schedule => "Match schedule",
            CacheStepId::ScoutingSchedule => "Scouting schedule",
            CacheStepId::ScoutRoster => "Scout roster",
            CacheStepId::PitEntries => "Pit scouting data",
            CacheStepId::MatchEntries => "Match scouting data",
        }
    }

    /// Whether the step runs in the given mode.
    pub fn in_mode(&self, mode: CacheMode) -> bool {
        match self {
            CacheStepId::PitEntries | CacheStepId::MatchEntries => mode == CacheMode::Full,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStepStatus {
    Pending,
    Loading,
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStep {
    pub id: CacheStepId,
    pub label: String,
    pub status: CacheStepStatus,
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl CacheStep {
    pub fn new(id: CacheStepId) -> Self {
        Self {
            id,
            label: id.label().to_string(),
            status: CacheStepStatus::Pending,
            detail: None,
            error: None,
        }
    }
}

/// Per-event cache metadata; one row per event code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventCacheStatus {
    pub event_code: String,
    pub year: i32,
    pub cached_at: DateTime<Utc>,
    pub teams_count: i64,
    pub pit_entries_count: i64,
    pub match_entries_count: i64,
    pub pages_cached: bool,
    pub session_cached: bool,
    pub schedules_cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::Syncing,
            EntryStatus::Synced,
            EntryStatus::Error,
        ] {
            assert_eq!(EntryStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(EntryStatus::parse_status("done"), None);
        assert_eq!(EntryKind::parse_kind("scoreboard"), None);
    }

    #[test]
    fn scout_mode_excludes_bulk_entry_steps() {
        let scout: Vec<_> = CacheStepId::ALL
            .iter()
            .filter(|s| s.in_mode(CacheMode::Scout))
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            scout,
            vec![
                "session",
                "pages",
                "teams",
                "schedule",
                "scouting-schedule",
                "scout-roster"
            ]
        );
        assert!(CacheStepId::ALL.iter().all(|s| s.in_mode(CacheMode::Full)));
    }

    #[test]
    fn sync_result_success_tracks_failures() {
        assert!(SyncResult::new(3, 0, vec![]).success);
        assert!(!SyncResult::new(3, 1, vec!["x".into()]).success);
        assert!(!SyncResult::failed("store closed").success);
    }

    #[test]
    fn config_update_overrides_only_given_fields() {
        let update = SyncConfigUpdate {
            batch_size: Some(25),
            ..Default::default()
        };
        let merged = update.apply(SyncConfig::default());
        assert_eq!(merged.batch_size, 25);
        assert_eq!(merged.max_retries, SyncConfig::default().max_retries);
    }

    #[test]
    fn queued_entry_serializes_type_field() {
        let entry = QueuedEntry {
            id: "1-abc".into(),
            kind: EntryKind::Pit,
            status: EntryStatus::Pending,
            data: serde_json::json!({"team": 254}),
            created_at: Utc::now(),
            last_attempt: None,
            attempts: 0,
            remote_id: None,
            error: None,
            rejected: false,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "pit");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["remoteId"], serde_json::Value::Null);
    }
}
