//! Session registry: per-conversation turn history and counters.
//!
//! Sessions are created on first contact and updated on every turn.
//! Idle sessions are evicted on a schedule to bound memory; eviction
//! and explicit close both leave the cumulative statistics untouched.
//! Recording against an id the registry has explicitly closed is the
//! only way to get `SessionNotFound`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Detection;
use crate::stats::Statistics;

/// Errors raised by the session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session id was explicitly closed.
    #[error("session {0} not found (closed)")]
    SessionNotFound(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// One user message paired with its assistant response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// What the user sent.
    pub user_message: String,
    /// What the model replied.
    pub assistant_response: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
    /// Detections the turn produced.
    pub detections: Vec<Detection>,
}

/// A tracked conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique id.
    pub session_id: String,
    /// When the session was opened.
    pub created_at: DateTime<Utc>,
    /// When the session last recorded a turn.
    pub last_activity: DateTime<Utc>,
    /// Ordered turn history.
    pub turns: Vec<Turn>,
    /// Turns recorded.
    pub message_count: u64,
    /// Detections across all turns.
    pub detection_count: u64,
}

impl Session {
    fn new(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            turns: Vec::new(),
            message_count: 0,
            detection_count: 0,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    closed: HashSet<String>,
    stats: Statistics,
}

/// Tracks active conversations and cumulative statistics.
///
/// Clonable; all clones share the same state. Each connection task owns
/// its session's happy path, so per-session mutation is effectively
/// single-writer; the lock serializes the cross-session counters.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or resumes a session, minting a fresh id when none is
    /// supplied. Returns the session id.
    pub fn open(&self, session_id: Option<&str>) -> String {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = self.inner.write().unwrap();
        state.closed.remove(&id);
        if !state.sessions.contains_key(&id) {
            state.sessions.insert(id.clone(), Session::new(id.clone()));
            state.stats.record_conversation();
            info!(session_id = %id, "session opened");
        }
        id
    }

    /// Appends a turn to a session and updates its counters.
    ///
    /// An unknown id is treated as first contact and the session is
    /// created implicitly; an explicitly closed id is an error.
    pub fn record_turn(
        &self,
        session_id: &str,
        user_message: &str,
        assistant_response: &str,
        detections: Vec<Detection>,
    ) -> Result<()> {
        let mut state = self.inner.write().unwrap();

        if state.closed.contains(session_id) {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }

        if !state.sessions.contains_key(session_id) {
            state
                .sessions
                .insert(session_id.to_string(), Session::new(session_id.to_string()));
            state.stats.record_conversation();
        }

        state.stats.record_message();
        for detection in &detections {
            state
                .stats
                .record_detection(&detection.category, detection.severity);
        }

        let detection_count = detections.len() as u64;
        let session = state
            .sessions
            .get_mut(session_id)
            .expect("session inserted above");
        session.message_count += 1;
        session.detection_count += detection_count;
        session.last_activity = Utc::now();
        session.turns.push(Turn {
            user_message: user_message.to_string(),
            assistant_response: assistant_response.to_string(),
            timestamp: session.last_activity,
            detections,
        });

        Ok(())
    }

    /// Closes a session, removing its entry. Cumulative statistics are
    /// unaffected; a later `record_turn` on the id fails.
    pub fn close(&self, session_id: &str) {
        let mut state = self.inner.write().unwrap();
        if state.sessions.remove(session_id).is_some() {
            debug!(session_id = %session_id, "session closed");
        }
        state.closed.insert(session_id.to_string());
    }

    /// Removes sessions idle beyond the timeout. Returns how many were
    /// evicted. Evicted ids are not marked closed: a returning client
    /// simply starts over as first contact.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::zero());

        let mut state = self.inner.write().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.last_activity > cutoff);
        let evicted = before - state.sessions.len();
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
        evicted
    }

    /// Returns a copy of a session.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().unwrap().sessions.get(session_id).cloned()
    }

    /// Returns the number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    /// Returns a read-only copy of the cumulative statistics.
    pub fn snapshot_stats(&self) -> Statistics {
        self.inner.read().unwrap().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::Severity;

    fn detection(rule_id: &str, category: &str) -> Detection {
        Detection {
            rule_id: rule_id.to_string(),
            title: rule_id.to_string(),
            category: category.to_string(),
            severity: Severity::High,
            confidence: 0.9,
            description: String::new(),
            matched_snippet: String::new(),
            recommendation: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn open_mints_unique_ids() {
        let registry = SessionRegistry::new();
        let a = registry.open(None);
        let b = registry.open(None);
        assert_ne!(a, b);
        assert_eq!(registry.active_sessions(), 2);
    }

    #[test]
    fn open_resumes_existing_session() {
        let registry = SessionRegistry::new();
        let id = registry.open(Some("conv-1"));
        assert_eq!(id, "conv-1");

        registry.open(Some("conv-1"));
        assert_eq!(registry.active_sessions(), 1);
        assert_eq!(registry.snapshot_stats().total_conversations, 1);
    }

    #[test]
    fn record_turn_updates_counters_exactly() {
        let registry = SessionRegistry::new();
        let id = registry.open(None);

        registry
            .record_turn(&id, "hi", "hello", vec![])
            .unwrap();
        registry
            .record_turn(
                &id,
                "how to hack",
                "no",
                vec![detection("r1", "hacking"), detection("r2", "hacking")],
            )
            .unwrap();

        let session = registry.get(&id).unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.detection_count, 2);
        assert_eq!(session.turns.len(), 2);

        // Counter invariant: detection_count equals the sum across turns.
        let sum: usize = session.turns.iter().map(|t| t.detections.len()).sum();
        assert_eq!(session.detection_count, sum as u64);
    }

    #[test]
    fn record_turn_on_unknown_id_is_first_contact() {
        let registry = SessionRegistry::new();
        registry
            .record_turn("fresh", "hi", "hello", vec![])
            .unwrap();

        assert_eq!(registry.active_sessions(), 1);
        let stats = registry.snapshot_stats();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 1);
    }

    #[test]
    fn record_turn_on_closed_id_fails() {
        let registry = SessionRegistry::new();
        let id = registry.open(Some("conv-1"));
        registry.close(&id);

        let err = registry
            .record_turn(&id, "hi", "hello", vec![])
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[test]
    fn close_preserves_statistics() {
        let registry = SessionRegistry::new();
        let id = registry.open(None);
        registry
            .record_turn(&id, "x", "y", vec![detection("r1", "hacking")])
            .unwrap();
        registry.close(&id);

        assert_eq!(registry.active_sessions(), 0);
        let stats = registry.snapshot_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.total_detections, 1);
    }

    #[test]
    fn eviction_removes_sessions_but_not_stats() {
        let registry = SessionRegistry::new();
        for _ in 0..10 {
            let id = registry.open(None);
            for _ in 0..3 {
                registry.record_turn(&id, "hi", "hello", vec![]).unwrap();
            }
        }

        let evicted = registry.evict_idle(Duration::ZERO);
        assert_eq!(evicted, 10);
        assert_eq!(registry.active_sessions(), 0);

        let stats = registry.snapshot_stats();
        assert_eq!(stats.total_conversations, 10);
        assert_eq!(stats.total_messages, 30);
    }

    #[test]
    fn eviction_spares_recent_sessions() {
        let registry = SessionRegistry::new();
        let id = registry.open(None);
        registry.record_turn(&id, "hi", "hello", vec![]).unwrap();

        let evicted = registry.evict_idle(Duration::from_secs(3600));
        assert_eq!(evicted, 0);
        assert_eq!(registry.active_sessions(), 1);
    }

    #[test]
    fn evicted_id_can_return_as_first_contact() {
        let registry = SessionRegistry::new();
        let id = registry.open(Some("conv-1"));
        registry.record_turn(&id, "a", "b", vec![]).unwrap();
        registry.evict_idle(Duration::ZERO);

        // Not closed, so recording works again and counts a new conversation.
        registry.record_turn(&id, "c", "d", vec![]).unwrap();
        assert_eq!(registry.snapshot_stats().total_conversations, 2);
    }

    #[test]
    fn stats_track_category_and_severity() {
        let registry = SessionRegistry::new();
        let id = registry.open(None);
        registry
            .record_turn(
                &id,
                "x",
                "y",
                vec![detection("r1", "hacking"), detection("cs", "child_safety")],
            )
            .unwrap();

        let stats = registry.snapshot_stats();
        assert_eq!(stats.detections_by_category["hacking"], 1);
        assert_eq!(stats.detections_by_category["child_safety"], 1);
        assert_eq!(stats.detections_by_severity["high"], 2);
    }
}
