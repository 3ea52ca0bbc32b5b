//! Aggregate detection statistics and their on-disk snapshot form.
//!
//! Counters are cumulative for the life of the process: evicting or
//! closing a session never decrements them. Snapshots are rewritten
//! atomically (temp file + rename) so a crashed flush can never leave a
//! half-written document behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patterns::Severity;

/// Errors raised while persisting or loading statistics.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Snapshot file could not be read or written.
    #[error("stats io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file is not valid JSON.
    #[error("stats parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for statistics operations.
pub type Result<T> = std::result::Result<T, StatsError>;

/// Process-wide cumulative detection counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Sessions opened since startup.
    pub total_conversations: u64,
    /// Turns processed since startup.
    pub total_messages: u64,
    /// Detections produced since startup.
    pub total_detections: u64,
    /// Detection counts keyed by rule category.
    pub detections_by_category: BTreeMap<String, u64>,
    /// Detection counts keyed by severity name.
    pub detections_by_severity: BTreeMap<String, u64>,
}

impl Statistics {
    /// Records one opened conversation.
    pub fn record_conversation(&mut self) {
        self.total_conversations += 1;
    }

    /// Records one processed turn.
    pub fn record_message(&mut self) {
        self.total_messages += 1;
    }

    /// Records one detection under its category and severity.
    pub fn record_detection(&mut self, category: &str, severity: Severity) {
        self.total_detections += 1;
        *self
            .detections_by_category
            .entry(category.to_string())
            .or_insert(0) += 1;
        *self
            .detections_by_severity
            .entry(severity.as_str().to_string())
            .or_insert(0) += 1;
    }
}

/// A point-in-time view of the statistics, as persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Process uptime, rendered as "{h}h {m}m {s}s".
    pub uptime: String,
    /// Connections open at snapshot time.
    pub active_connections: usize,
    /// Cumulative counters.
    #[serde(flatten)]
    pub stats: Statistics,
    /// When the snapshot was written (RFC 3339).
    pub saved_at: String,
}

impl StatsSnapshot {
    /// Builds a snapshot stamped with the current time.
    pub fn new(stats: Statistics, uptime: Duration, active_connections: usize) -> Self {
        Self {
            uptime: format_uptime(uptime),
            active_connections,
            stats,
            saved_at: Utc::now().to_rfc3339(),
        }
    }

    /// Writes the snapshot to `path`, atomically.
    ///
    /// The document is written to a temporary sibling first and then
    /// renamed over the destination, so readers never observe a partial
    /// file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a snapshot from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Renders a duration as "{h}h {m}m {s}s".
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_detection_updates_all_counters() {
        let mut stats = Statistics::default();
        stats.record_detection("hacking", Severity::High);
        stats.record_detection("hacking", Severity::Medium);
        stats.record_detection("child_safety", Severity::High);

        assert_eq!(stats.total_detections, 3);
        assert_eq!(stats.detections_by_category["hacking"], 2);
        assert_eq!(stats.detections_by_category["child_safety"], 1);
        assert_eq!(stats.detections_by_severity["high"], 2);
        assert_eq!(stats.detections_by_severity["medium"], 1);
    }

    #[test]
    fn uptime_format_matches_expected_shape() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "0h 0m 59s");
        assert_eq!(format_uptime(Duration::from_secs(3600 + 62)), "1h 1m 2s");
        assert_eq!(format_uptime(Duration::from_secs(7322)), "2h 2m 2s");
    }

    #[test]
    fn snapshot_round_trip_preserves_counts() {
        let mut stats = Statistics::default();
        stats.record_conversation();
        stats.record_message();
        stats.record_detection("hacking", Severity::High);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let snapshot = StatsSnapshot::new(stats.clone(), Duration::from_secs(90), 2);
        snapshot.save(&path).unwrap();

        let loaded = StatsSnapshot::load(&path).unwrap();
        assert_eq!(loaded.stats, stats);
        assert_eq!(loaded.active_connections, 2);
        assert_eq!(loaded.uptime, "0h 1m 30s");
    }

    #[test]
    fn snapshot_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let snapshot = StatsSnapshot::new(Statistics::default(), Duration::from_secs(1), 0);
        snapshot.save(&path).unwrap();
        snapshot.save(&path).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("stats.json")]);
    }

    #[test]
    fn snapshot_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("stats.json");

        let snapshot = StatsSnapshot::new(Statistics::default(), Duration::from_secs(1), 0);
        snapshot.save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn snapshot_json_uses_wire_field_names() {
        let mut stats = Statistics::default();
        stats.record_detection("hacking", Severity::Low);
        let snapshot = StatsSnapshot::new(stats, Duration::from_secs(5), 1);

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        for key in [
            "uptime",
            "active_connections",
            "total_conversations",
            "total_messages",
            "total_detections",
            "detections_by_category",
            "detections_by_severity",
            "saved_at",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }
}
