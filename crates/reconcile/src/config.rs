use remote::RemoteConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use store::EntityKind;

use crate::{Result, SyncError};

/// Runtime settings for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub db_path: PathBuf,

    /// Quiet period after the last trigger before a pass starts
    pub debounce_ms: u64,

    pub periodic_interval_secs: u64,

    /// Rejections before a record is quarantined (0 disables quarantine)
    pub max_rejections: u32,

    pub remote: RemoteConfig,

    /// Kinds whose remote inserts are watched for notices
    pub realtime_kinds: Vec<EntityKind>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: store::default_db_path(),
            debounce_ms: 500,
            periodic_interval_secs: 300,
            max_rejections: 5,
            remote: RemoteConfig::default(),
            realtime_kinds: vec![EntityKind::Dossier],
        }
    }
}

impl SyncConfig {
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_max_rejections(mut self, max: u32) -> Self {
        self.max_rejections = max;
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_realtime_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.realtime_kinds = kinds;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| SyncError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Config(format!("writing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.periodic_interval(), Duration::from_secs(300));
        assert_eq!(config.max_rejections, 5);
        assert!(config.db_path.ends_with("fieldsync.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldsync.json");
        let config = SyncConfig::default()
            .with_db_path(dir.path().join("db.sqlite"))
            .with_max_rejections(2)
            .with_remote(RemoteConfig::rest("https://example.test", "anon"));
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"debounce_ms": 50}"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.max_rejections, 5);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SyncConfig::load(Path::new("/nonexistent/fieldsync.json")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
