//! Runtime configuration.
//!
//! Configuration is an explicit object passed at construction, not
//! module-level state. A missing or corrupt config file falls back to
//! the hard-coded defaults with a warning; nothing at startup fails on
//! a bad config.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::Policy;

/// Default monitor endpoint.
pub const DEFAULT_HOST: &str = "localhost";

/// Default monitor port.
pub const DEFAULT_PORT: u16 = 8765;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Config file is not valid JSON.
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// What the client guard does when the remote monitor is unreachable.
///
/// Always configured explicitly; there is no implicit default path at
/// the decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Allow the turn through and log a warning.
    #[default]
    FailOpen,
    /// Block the turn.
    FailClosed,
}

/// Threshold and blocking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interventions {
    /// Whether threshold breaches block rather than warn.
    pub block_policy_violations: bool,
    /// Confidence at or above which a block is considered.
    pub alert_threshold: f32,
    /// Confidence at or above which a warning is raised.
    pub warn_threshold: f32,
}

impl Default for Interventions {
    fn default() -> Self {
        Self {
            block_policy_violations: true,
            alert_threshold: 0.7,
            warn_threshold: 0.5,
        }
    }
}

/// Top-level configuration for the monitor and the client guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Host the monitor binds (and the client connects) to.
    pub host: String,
    /// Port the monitor binds (and the client connects) to.
    pub port: u16,
    /// Directory of rule files (every `.json` inside is loaded).
    pub patterns_path: PathBuf,
    /// Where statistics snapshots are written.
    pub stats_path: PathBuf,
    /// Where the alert log appends.
    pub alert_log_path: PathBuf,
    /// Seconds between statistics flushes.
    pub stats_interval_secs: u64,
    /// Seconds a session may sit idle before eviction.
    pub session_idle_timeout_secs: u64,
    /// Seconds between eviction sweeps.
    pub eviction_sweep_secs: u64,
    /// Threshold and blocking settings.
    pub interventions: Interventions,
    /// Per-category kill switches.
    pub active_safeguards: BTreeMap<String, bool>,
    /// Client behavior when the monitor is unreachable.
    pub fallback_mode: FallbackMode,
}

impl Default for WardenConfig {
    fn default() -> Self {
        let mut active_safeguards = BTreeMap::new();
        for category in [
            "policy_violation",
            "child_safety",
            "content_moderation",
            "prompt_injection",
            "data_leakage",
        ] {
            active_safeguards.insert(category.to_string(), true);
        }

        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            patterns_path: PathBuf::from("./patterns"),
            stats_path: PathBuf::from("./warden_stats.json"),
            alert_log_path: PathBuf::from("./warden_alerts.jsonl"),
            stats_interval_secs: 300,
            session_idle_timeout_secs: 1800,
            eviction_sweep_secs: 60,
            interventions: Interventions::default(),
            active_safeguards,
            fallback_mode: FallbackMode::FailOpen,
        }
    }
}

impl WardenConfig {
    /// Loads configuration, falling back to defaults on any failure.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Err(e) => {
                warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Loads configuration, surfacing the failure.
    pub fn try_load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self).expect("config serializes");
        fs::write(path, json)
    }

    /// Builds the decision policy from the intervention settings.
    pub fn policy(&self) -> Policy {
        Policy::new(
            self.interventions.alert_threshold,
            self.interventions.warn_threshold,
            self.interventions.block_policy_violations,
        )
    }

    /// Returns the monitor address as "host:port".
    pub fn monitor_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WardenConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8765);
        assert_eq!(config.interventions.alert_threshold, 0.7);
        assert_eq!(config.interventions.warn_threshold, 0.5);
        assert!(config.interventions.block_policy_violations);
        assert_eq!(config.stats_interval_secs, 300);
        assert_eq!(config.fallback_mode, FallbackMode::FailOpen);
        assert_eq!(config.active_safeguards.len(), 5);
        assert!(config.active_safeguards["child_safety"]);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = WardenConfig::load(Path::new("/nonexistent/warden.json"));
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");
        fs::write(&path, "{broken").unwrap();

        let config = WardenConfig::load(&path);
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");
        fs::write(
            &path,
            r#"{"port": 9100, "fallback_mode": "fail_closed"}"#,
        )
        .unwrap();

        let config = WardenConfig::load(&path);
        assert_eq!(config.port, 9100);
        assert_eq!(config.fallback_mode, FallbackMode::FailClosed);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.interventions.alert_threshold, 0.7);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("warden.json");

        let mut config = WardenConfig::default();
        config.port = 9200;
        config.active_safeguards.insert("hacking".to_string(), false);
        config.save(&path).unwrap();

        let loaded = WardenConfig::try_load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn policy_reflects_interventions() {
        let mut config = WardenConfig::default();
        config.interventions.alert_threshold = 0.9;
        config.interventions.warn_threshold = 0.4;

        let policy = config.policy();
        assert_eq!(policy.alert_threshold, 0.9);
        assert_eq!(policy.warn_threshold, 0.4);
        assert!(policy.is_child_safety("child_safety"));
    }
}
