//! Store configuration
//!
//! Registry-wide defaults live in `hoard.toml`:
//!
//! ```toml
//! key_prefix = "hoard:"
//! debounce_ms = 300
//! db_name = "hoard"
//! store_name = "state"
//! data_dir = ".hoard"
//! emit_events = false
//! # hydrate_timeout_ms = 5000
//! ```
//!
//! Every field is optional. Per-cell [`PersistOptions`](crate::PersistOptions)
//! override these defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up by [`StoreConfig::load_from_dir`]
pub const CONFIG_FILE: &str = "hoard.toml";

/// Registry-wide persistence defaults
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prepended to the registry key to form the default storage key
    pub key_prefix: String,
    /// Write coalescing window
    pub debounce_ms: u64,
    /// Database used by the pooled backend when a cell names none
    pub db_name: String,
    /// Store (table) used by the pooled backend when a cell names none
    pub store_name: String,
    /// Directory for on-disk backends
    pub data_dir: Option<PathBuf>,
    pub emit_events: bool,
    /// Upper bound for the hydrate read; unbounded when absent
    pub hydrate_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "hoard:".to_string(),
            debounce_ms: 300,
            db_name: "hoard".to_string(),
            store_name: "state".to_string(),
            data_dir: None,
            emit_events: false,
            hydrate_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load `hoard.toml` from `dir`, or defaults when the file is absent
    ///
    /// A relative `data_dir` is resolved against `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(dir = %dir.display(), "no {CONFIG_FILE}, using defaults");
            return Ok(Self::default());
        }

        let mut config = Self::load(&path)?;
        if let Some(data_dir) = config.data_dir.as_mut() {
            if data_dir.is_relative() {
                *data_dir = dir.join(&*data_dir);
            }
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn hydrate_timeout(&self) -> Option<Duration> {
        self.hydrate_timeout_ms.map(Duration::from_millis)
    }

    /// Default storage key for a registry key
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_emit_events(mut self, emit: bool) -> Self {
        self.emit_events = emit;
        self
    }

    pub fn with_hydrate_timeout_ms(mut self, ms: u64) -> Self {
        self.hydrate_timeout_ms = Some(ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.storage_key("todos"), "hoard:todos");
        assert_eq!(config.hydrate_timeout(), None);
    }

    #[test]
    fn test_partial_file() {
        let config = StoreConfig::parse(
            r#"
            key_prefix = "app."
            debounce_ms = 50
            hydrate_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.key_prefix, "app.");
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.db_name, "hoard");
        assert_eq!(config.hydrate_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            StoreConfig::load_from_dir(dir.path()).unwrap(),
            StoreConfig::default()
        );

        StoreConfig::default()
            .with_data_dir("data")
            .with_emit_events(true)
            .save(&dir.path().join(CONFIG_FILE))
            .unwrap();

        let loaded = StoreConfig::load_from_dir(dir.path()).unwrap();
        assert!(loaded.emit_events);
        assert_eq!(loaded.data_dir, Some(dir.path().join("data")));
    }

    #[test]
    fn test_malformed_file() {
        assert!(StoreConfig::parse("debounce_ms = \"soon\"").is_err());
    }
}
