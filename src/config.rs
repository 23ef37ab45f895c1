//! Transport tuning knobs.
//!
//! Values come from defaults, an optional JSON file, then `IPCBUS_*`
//! environment variables, in that order.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tuning for publishers and subscribers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct IpcConfig {
    /// Per-connection outbound buffer bound for publishers, in bytes.
    /// 0 means unbounded.
    pub ipc_write_buffer: usize,
    /// Interval in seconds at which an idle subscriber read loop wakes up
    /// to check whether anyone is still listening.
    pub subscriber_poll_secs: u64,
    /// Bound in seconds for each connect attempt made on behalf of subscribers.
    pub subscriber_connect_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ipc_write_buffer: 0,
            subscriber_poll_secs: 5,
            subscriber_connect_timeout_secs: 5,
        }
    }
}

impl IpcConfig {
    /// Load `path` (JSON) and apply environment overrides. Missing keys keep
    /// their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `IPCBUS_WRITE_BUFFER`, `IPCBUS_POLL_SECS` and
    /// `IPCBUS_CONNECT_TIMEOUT_SECS`. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(size) = lookup("IPCBUS_WRITE_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
            self.ipc_write_buffer = size;
        }

        if let Some(secs) = lookup("IPCBUS_POLL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.subscriber_poll_secs = secs;
        }

        if let Some(secs) = lookup("IPCBUS_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.subscriber_connect_timeout_secs = secs;
        }
    }

    /// Publisher write buffer bound, `None` when unbounded.
    pub fn write_buffer_limit(&self) -> Option<usize> {
        (self.ipc_write_buffer > 0).then_some(self.ipc_write_buffer)
    }

    /// Default poll interval of the subscriber read loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.subscriber_poll_secs)
    }

    /// Bound for each subscriber connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.subscriber_connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = IpcConfig::default();
        assert_eq!(config.ipc_write_buffer, 0);
        assert_eq!(config.write_buffer_limit(), None);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ipc.json");
        std::fs::write(&path, r#"{"ipc_write_buffer": 4096}"#).unwrap();

        let config = IpcConfig::load(&path).unwrap();
        assert_eq!(config.write_buffer_limit(), Some(4096));
        assert_eq!(config.subscriber_poll_secs, 5);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = IpcConfig::load(&path).unwrap_err();
        assert!(format!("{err}").contains("broken.json"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("IPCBUS_WRITE_BUFFER", "1024"),
            ("IPCBUS_POLL_SECS", "not-a-number"),
            ("IPCBUS_CONNECT_TIMEOUT_SECS", "9"),
        ]);
        let mut config = IpcConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.ipc_write_buffer, 1024);
        assert_eq!(config.subscriber_poll_secs, 5);
        assert_eq!(config.subscriber_connect_timeout_secs, 9);
    }
}
