//! Engine configuration.
//!
//! Loads settings from a TOML file when one is present, otherwise uses
//! defaults. All tunables the update flow depends on live here: retry
//! limit, timeouts, confirmation window, retention and progress throttling.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Directory name under the platform data dir used when no root is given.
pub const DEFAULT_STORE_DIR: &str = "hotpush";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory of the bundle store.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Path to the bundle shipped with the host install. Resolution falls
    /// back to this until a downloaded bundle has been activated.
    pub fallback_bundle: PathBuf,

    /// Maximum download attempts per cycle before the error is reported.
    #[serde(default = "default_max_download_attempts")]
    pub max_download_attempts: u32,

    /// Seconds without a received chunk before a download counts as stalled.
    #[serde(default = "default_stall_timeout")]
    pub download_stall_timeout_secs: u64,

    /// Connect/request timeout in seconds for descriptor fetches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds the host shell has to confirm a newly activated bundle.
    #[serde(default = "default_confirmation_window")]
    pub confirmation_window_secs: u64,

    /// How many bundle records count-based pruning keeps.
    #[serde(default = "default_retained_versions")]
    pub retained_versions: usize,

    /// Minimum interval between emitted progress events, in milliseconds.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// User-agent header for all engine HTTP traffic.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_root_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_STORE_DIR)
}

fn default_max_download_attempts() -> u32 {
    3
}

fn default_stall_timeout() -> u64 {
    20
}

fn default_request_timeout() -> u64 {
    30
}

fn default_confirmation_window() -> u64 {
    30
}

fn default_retained_versions() -> usize {
    3
}

fn default_progress_interval() -> u64 {
    250
}

fn default_user_agent() -> String {
    format!("hotpush/{}", env!("CARGO_PKG_VERSION"))
}

impl EngineConfig {
    /// Config rooted at an explicit store directory and fallback bundle.
    pub fn with_root(root_dir: impl Into<PathBuf>, fallback_bundle: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            fallback_bundle: fallback_bundle.into(),
            max_download_attempts: default_max_download_attempts(),
            download_stall_timeout_secs: default_stall_timeout(),
            request_timeout_secs: default_request_timeout(),
            confirmation_window_secs: default_confirmation_window(),
            retained_versions: default_retained_versions(),
            progress_interval_ms: default_progress_interval(),
            user_agent: default_user_agent(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to the given
    /// defaults when the file is missing or unreadable.
    pub fn load_or(path: impl AsRef<Path>, fallback: Self) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return fallback;
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default config: {e:#}");
                fallback
            }
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.download_stall_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_root_uses_documented_defaults() {
        let config = EngineConfig::with_root("/tmp/store", "/opt/app/bundle.gz");
        assert_eq!(config.max_download_attempts, 3);
        assert_eq!(config.confirmation_window_secs, 30);
        assert_eq!(config.progress_interval_ms, 250);
        assert_eq!(config.retained_versions, 3);
        assert!(config.user_agent.starts_with("hotpush/"));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            fallback_bundle = "/opt/app/bundle.gz"
            max_download_attempts = 5
            confirmation_window_secs = 10
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_download_attempts, 5);
        assert_eq!(config.confirmation_window_secs, 10);
        // untouched fields keep their defaults
        assert_eq!(config.download_stall_timeout_secs, 20);
        assert_eq!(config.fallback_bundle, PathBuf::from("/opt/app/bundle.gz"));
    }

    #[test]
    fn load_or_falls_back_when_missing() {
        let fallback = EngineConfig::with_root("/tmp/store", "/opt/app/bundle.gz");
        let config = EngineConfig::load_or("/nonexistent/hotpush.toml", fallback.clone());
        assert_eq!(config.root_dir, fallback.root_dir);
    }
}
