//! Configuration loader and validator for the day sync client.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::session::SessionSettings;

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
    #[serde(default)]
    pub sync: SyncTuning,
    #[serde(default)]
    pub feed: Feed,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Optimistic-update tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncTuning {
    pub debounce_ms: u64,
    pub saving_min_visible_ms: u64,
    pub stale_op_after_secs: u64,
    pub recent_ack_capacity: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            debounce_ms: 600,
            saving_min_visible_ms: 250,
            stale_op_after_secs: 30,
            recent_ack_capacity: 256,
        }
    }
}

/// Push feed and channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Feed {
    pub reconnect_base_ms: u64,
    pub max_backoff_seconds: u64,
    pub channel_capacity: usize,
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 500,
            max_backoff_seconds: 60,
            channel_capacity: 256,
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

    /// Default database location inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/daysync.db", self.app.data_dir.trim_end_matches('/'))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            debounce: Duration::from_millis(self.sync.debounce_ms),
            saving_min_visible: Duration::from_millis(self.sync.saving_min_visible_ms),
            recent_ack_capacity: self.sync.recent_ack_capacity,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            reconnect_base: Duration::from_millis(self.feed.reconnect_base_ms),
            max_backoff: Duration::from_secs(self.feed.max_backoff_seconds),
            stale_op_after: Duration::from_secs(self.sync.stale_op_after_secs),
            channel_capacity: self.feed.channel_capacity,
        }
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
    // debounce_ms = 0 is allowed: every edit commits on the next tick.
    if cfg.sync.stale_op_after_secs == 0 {
        return Err(ConfigError::Invalid("sync.stale_op_after_secs must be > 0"));
    }
    if cfg.feed.reconnect_base_ms == 0 {
        return Err(ConfigError::Invalid("feed.reconnect_base_ms must be > 0"));
    }
    if cfg.feed.max_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("feed.max_backoff_seconds must be > 0"));
    }
    if cfg.feed.channel_capacity == 0 {
        return Err(ConfigError::Invalid("feed.channel_capacity must be > 0"));
    }
    Ok(())
}

/// Returns the example YAML shipped as `config.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

sync:
  debounce_ms: 600
  saving_min_visible_ms: 250
  stale_op_after_secs: 30
  recent_ack_capacity: 256

feed:
  reconnect_base_ms: 500
  max_backoff_seconds: 60
  channel_capacity: 256
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync, SyncTuning::default());
        assert_eq!(cfg.feed, Feed::default());
    }

    #[test]
    fn sections_default_when_missing() {
        let cfg: Config = serde_yaml::from_str("app:\n  data_dir: \"/tmp/d\"\nsync:\n  debounce_ms: 10\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync.debounce_ms, 10);
        assert_eq!(cfg.sync.saving_min_visible_ms, 250);
        assert_eq!(cfg.feed.max_backoff_seconds, 60);
        assert_eq!(cfg.engine_settings().debounce, Duration::from_millis(10));
    }

    #[test]
    fn invalid_data_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("app.data_dir")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_feed_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.feed.reconnect_base_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("reconnect_base_ms")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.feed.channel_capacity = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.stale_op_after_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.database_url().ends_with("/data/daysync.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.session_settings().max_backoff, Duration::from_secs(60));
        assert!(matches!(load(Some(&td.path().join("missing.yaml"))), Err(ConfigError::Io(_))));
    }
}
