//! Configuration loader and validator for the offline sync daemon and tools.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    pub sync: SyncDefaults,
    #[serde(default)]
    pub cache: Cache,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Connectivity watcher period.
    pub poll_interval_ms: u64,
}

/// Remote scouting server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    pub timeout_ms: u64,
}

/// Seed values for the persisted sync config, used on first start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncDefaults {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub batch_size: u32,
    pub auto_sync_enabled: bool,
    /// Entries stuck in `syncing` longer than this are requeued on startup.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    /// Static page paths fetched by the pages step.
    #[serde(default)]
    pub pages: Vec<String>,
}

fn default_stale_after_secs() -> u64 {
    300
}

impl SyncDefaults {
    pub fn defaults(&self) -> SyncConfig {
        SyncConfig {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            batch_size: self.batch_size,
            auto_sync_enabled: self.auto_sync_enabled,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/scout-sync.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if reqwest::Url::parse(&cfg.remote.base_url).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be a valid URL"));
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.timeout_ms must be > 0"));
    }

    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be > 0"));
    }

    if cfg.cache.pages.iter().any(|p| !p.starts_with('/')) {
        return Err(ConfigError::Invalid("cache.pages entries must start with '/'"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 15000

remote:
  base_url: "https://scouting.example.org/"
  token: "YOUR_API_TOKEN"
  timeout_ms: 15000

sync:
  max_retries: 3
  retry_delay_ms: 5000
  batch_size: 10
  auto_sync_enabled: true
  stale_after_secs: 300

cache:
  pages:
    - "/"
    - "/scout/pit"
    - "/scout/match"
    - "/offline"
"#
}
