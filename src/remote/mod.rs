use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::EntryKind;
use crate::remote::model::{ListResponse, SubmitResponse};

pub mod model;

/// Why a submission did not produce a remote id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Unreachable, timed out, throttled or 5xx. Safe to retry.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Validation failure or duplicate record. Retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Remote service accepting one pit or match record per request.
#[async_trait]
pub trait SubmissionService: Send + Sync {
    async fn submit(&self, kind: EntryKind, data: &Value) -> Result<i64, SubmitError>;
}

/// Read-only endpoints consumed by the event cache pipeline.
#[async_trait]
pub trait EventDataService: Send + Sync {
    async fn fetch_session(&self) -> Result<Value>;
    async fn fetch_page(&self, path: &str) -> Result<String>;
    async fn fetch_teams(&self, event_code: &str) -> Result<Vec<Value>>;
    async fn fetch_schedule(&self, event_code: &str) -> Result<Vec<Value>>;
    async fn fetch_scouting_schedule(&self, event_code: &str) -> Result<Vec<Value>>;
    async fn fetch_scout_roster(&self, event_code: &str) -> Result<Vec<Value>>;
    async fn fetch_pit_entries(&self, event_code: &str, year: i32) -> Result<Vec<Value>>;
    async fn fetch_match_entries(&self, event_code: &str, year: i32) -> Result<Vec<Value>>;
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("scout-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
        Self::new(
            base_url,
            cfg.remote.token.clone(),
            Duration::from_millis(cfg.remote.timeout_ms),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid endpoint path {}", path))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    pub fn build_submit_request(&self, kind: EntryKind, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self.endpoint(&format!("api/{}", kind.as_str()))?;
        self.authorized(self.http.post(endpoint))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build submission request")
    }

    async fn get_list(&self, url: Url) -> Result<Vec<Value>> {
        debug!(url = %url, "fetching event data");
        let res = self
            .authorized(self.http.get(url.clone()))
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("{} returned {}: {}", url.path(), status, body));
        }
        let payload: ListResponse = res
            .json()
            .await
            .with_context(|| format!("invalid JSON from {}", url.path()))?;
        Ok(payload.into_items())
    }

    fn event_url(&self, event_code: &str, resource: &str) -> Result<Url> {
        self.endpoint(&format!("api/events/{}/{}", event_code, resource))
    }

    fn entries_url(&self, kind: EntryKind, event_code: &str, year: i32) -> Result<Url> {
        let mut url = self.endpoint(&format!("api/{}", kind.as_str()))?;
        url.query_pairs_mut()
            .append_pair("event", event_code)
            .append_pair("year", &year.to_string());
        Ok(url)
    }
}

/// Map a non-success response onto the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> SubmitError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            SubmitError::Rejected(format!("{}: {}", status, body))
        }
        _ => SubmitError::Transient(format!("{}: {}", status, body)),
    }
}

#[async_trait]
impl SubmissionService for RemoteClient {
    async fn submit(&self, kind: EntryKind, data: &Value) -> Result<i64, SubmitError> {
        let request = self
            .build_submit_request(kind, data)
            .map_err(|err| SubmitError::Transient(format!("{:#}", err)))?;
        debug!(url = %request.url(), kind = kind.as_str(), "submitting entry");

        // Timeouts and connection failures surface here and are retryable.
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| SubmitError::Transient(err.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, kind = kind.as_str(), "submission not accepted");
            return Err(classify_status(status, &body));
        }

        let payload: SubmitResponse = res
            .json()
            .await
            .map_err(|err| SubmitError::Transient(format!("invalid response body: {}", err)))?;
        Ok(payload.id)
    }
}

#[async_trait]
impl EventDataService for RemoteClient {
    async fn fetch_session(&self) -> Result<Value> {
        let url = self.endpoint("api/auth/session")?;
        let res = self
            .authorized(self.http.get(url))
            .send()
            .await
            .context("failed to reach session endpoint")?;
        if !res.status().is_success() {
            return Err(anyhow!("session endpoint returned {}", res.status()));
        }
        res.json().await.context("invalid session JSON")
    }

    async fn fetch_page(&self, path: &str) -> Result<String> {
        let url = self.endpoint(path)?;
        let res = self
            .authorized(self.http.get(url))
            .send()
            .await
            .with_context(|| format!("failed to fetch page {}", path))?;
        if !res.status().is_success() {
            return Err(anyhow!("page {} returned {}", path, res.status()));
        }
        res.text()
            .await
            .with_context(|| format!("failed to read page {}", path))
    }

    async fn fetch_teams(&self, event_code: &str) -> Result<Vec<Value>> {
        self.get_list(self.event_url(event_code, "teams")?).await
    }

    async fn fetch_schedule(&self, event_code: &str) -> Result<Vec<Value>> {
        self.get_list(self.event_url(event_code, "matches")?).await
    }

    async fn fetch_scouting_schedule(&self, event_code: &str) -> Result<Vec<Value>> {
        self.get_list(self.event_url(event_code, "scouting-blocks")?)
            .await
    }

    async fn fetch_scout_roster(&self, event_code: &str) -> Result<Vec<Value>> {
        self.get_list(self.event_url(event_code, "scouts")?).await
    }

    async fn fetch_pit_entries(&self, event_code: &str, year: i32) -> Result<Vec<Value>> {
        self.get_list(self.entries_url(EntryKind::Pit, event_code, year)?)
            .await
    }

    async fn fetch_match_entries(&self, event_code: &str, year: i32) -> Result<Vec<Value>> {
        self.get_list(self.entries_url(EntryKind::Match, event_code, year)?)
            .await
    }
}

#[async_trait]
impl ConnectivityProbe for RemoteClient {
    async fn is_online(&self) -> bool {
        let Ok(url) = self.endpoint("api/health") else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(res) => !res.status().is_server_error(),
            Err(err) => {
                debug!(error = %err, "connectivity probe failed");
                false
            }
        }
    }
}
