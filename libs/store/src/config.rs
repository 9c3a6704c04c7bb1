//! Configuration for the content store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const DEFAULT_HARD_CAP: u64 = 100 * 1024 * 1024 * 1024; // 100 GiB
const DEFAULT_SOFT_CAP: u64 = 80 * 1024 * 1024 * 1024; // 80 GiB

fn default_hard_cap() -> u64 {
    DEFAULT_HARD_CAP
}

fn default_soft_cap() -> u64 {
    DEFAULT_SOFT_CAP
}

fn default_true() -> bool {
    true
}

fn default_history_window() -> usize {
    16
}

fn default_quota_wait_ms() -> u64 {
    30_000
}

fn default_pin_wait_ms() -> u64 {
    10_000
}

fn default_purge_interval_ms() -> u64 {
    5_000
}

/// Content store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory the store owns. Everything under it is managed by the
    /// store; no external process should write here.
    pub root: PathBuf,

    /// Absolute ceiling on stored bytes. Reservations beyond this fail.
    #[serde(default = "default_hard_cap")]
    pub hard_cap_bytes: u64,

    /// Target the background purge drives the store back down to.
    #[serde(default = "default_soft_cap")]
    pub soft_cap_bytes: u64,

    /// Whether hardlink realization modes are available.
    #[serde(default = "default_true")]
    pub use_hard_links: bool,

    /// Whether blobs get read-only attributes after ingest (best-effort).
    #[serde(default = "default_true")]
    pub apply_deny_writes: bool,

    /// Run a full self-check when the store opens.
    #[serde(default)]
    pub self_check_on_startup: bool,

    /// Number of entries kept in the pin-size history ring.
    #[serde(default = "default_history_window")]
    pub history_window_size: usize,

    /// Override location for the pin-size history file.
    #[serde(default)]
    pub pin_history_path: Option<PathBuf>,

    /// Per-inode hardlink budget. When unset, the limit is learned from the
    /// first `EMLINK` the OS returns.
    #[serde(default)]
    pub hard_link_limit: Option<u64>,

    /// How long a reservation may wait for eviction to free space.
    #[serde(default = "default_quota_wait_ms")]
    pub max_quota_wait_ms: u64,

    /// How long a pin-taking lookup may wait on a contended hash lock
    /// before reporting the content unavailable.
    #[serde(default = "default_pin_wait_ms")]
    pub max_pin_wait_ms: u64,

    /// Background purge loop interval.
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,

    /// Skip re-ingest of content that is already pinned in the caller's
    /// context without taking the hash lock.
    #[serde(default)]
    pub pinned_fast_path: bool,
}

impl StoreConfig {
    /// Creates a configuration with defaults for everything but the root.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            hard_cap_bytes: DEFAULT_HARD_CAP,
            soft_cap_bytes: DEFAULT_SOFT_CAP,
            use_hard_links: true,
            apply_deny_writes: true,
            self_check_on_startup: false,
            history_window_size: default_history_window(),
            pin_history_path: None,
            hard_link_limit: None,
            max_quota_wait_ms: default_quota_wait_ms(),
            max_pin_wait_ms: default_pin_wait_ms(),
            purge_interval_ms: default_purge_interval_ms(),
            pinned_fast_path: false,
        }
    }

    /// Loads configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store config from {path:?}"))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store config from {path:?}"))
    }

    /// Loads configuration from environment variables, for embedding in
    /// agents that configure everything through the environment.
    ///
    /// `HOARD_ROOT` is required; `HOARD_HARD_CAP` and `HOARD_SOFT_CAP`
    /// override the byte caps.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var("HOARD_ROOT").context("HOARD_ROOT is not set")?;
        let mut config = Self::new(root);

        if let Some(cap) = std::env::var("HOARD_HARD_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.hard_cap_bytes = cap;
        }
        if let Some(cap) = std::env::var("HOARD_SOFT_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.soft_cap_bytes = cap;
        }

        Ok(config)
    }

    /// Validates the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> std::result::Result<(), StoreError> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Config("root path is empty".to_string()));
        }
        if self.hard_cap_bytes == 0 {
            return Err(StoreError::Config("hard cap must be non-zero".to_string()));
        }
        if self.soft_cap_bytes > self.hard_cap_bytes {
            return Err(StoreError::Config(format!(
                "soft cap {} exceeds hard cap {}",
                self.soft_cap_bytes, self.hard_cap_bytes
            )));
        }
        if self.history_window_size == 0 {
            return Err(StoreError::Config(
                "history window must hold at least one entry".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn max_quota_wait(&self) -> Duration {
        Duration::from_millis(self.max_quota_wait_ms)
    }

    pub(crate) fn max_pin_wait(&self) -> Duration {
        Duration::from_millis(self.max_pin_wait_ms)
    }

    pub(crate) fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StoreConfig::new("/var/lib/hoard");
        config.validate().unwrap();
        assert!(config.use_hard_links);
        assert!(config.apply_deny_writes);
        assert!(!config.pinned_fast_path);
    }

    #[test]
    fn test_soft_cap_above_hard_cap_rejected() {
        let mut config = StoreConfig::new("/var/lib/hoard");
        config.hard_cap_bytes = 10;
        config.soft_cap_bytes = 20;
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_empty_root_rejected() {
        let config = StoreConfig::new("");
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{ "root": "/var/lib/hoard", "hard_cap_bytes": 1024 }"#;
        let config: StoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/hoard"));
        assert_eq!(config.hard_cap_bytes, 1024);
        assert_eq!(config.history_window_size, default_history_window());
    }
}
