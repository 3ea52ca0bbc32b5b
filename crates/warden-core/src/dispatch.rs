//! Decision policy and alert fan-out.
//!
//! `decide` folds a batch of detections into a single allow/warn/block
//! verdict. `dispatch` then fans the verdict out to every enabled alert
//! channel; delivery is best-effort, a failing channel never blocks the
//! others.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::engine::Detection;

/// Verdict for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Let the turn through.
    #[default]
    Allow,
    /// Let the turn through, but raise an alert.
    Warn,
    /// Suppress the turn.
    Block,
}

impl Action {
    /// Returns a human-readable name for this action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Allow => "Allow",
            Action::Warn => "Warn",
            Action::Block => "Block",
        }
    }
}

/// The dispatcher's verdict for a turn, with the rules that drove it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The action to take.
    pub action: Action,
    /// Rule ids that drove the verdict.
    pub reasons: Vec<String>,
}

impl Decision {
    /// An allow decision with no contributing rules.
    pub fn allow() -> Self {
        Self::default()
    }

    /// A block decision with the given reasons.
    pub fn block(reasons: Vec<String>) -> Self {
        Self {
            action: Action::Block,
            reasons,
        }
    }

    /// Returns true if the action is Block.
    pub fn should_block(&self) -> bool {
        self.action == Action::Block
    }

    /// Returns true if the action is Warn.
    pub fn should_warn(&self) -> bool {
        self.action == Action::Warn
    }

    /// Returns true if the action is Allow.
    pub fn should_allow(&self) -> bool {
        self.action == Action::Allow
    }
}

/// Threshold policy applied to a batch of detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Confidence at or above which a block is considered.
    pub alert_threshold: f32,
    /// Confidence at or above which a warning is raised.
    pub warn_threshold: f32,
    /// Whether threshold breaches block (true) or only warn (false).
    pub block_policy_violations: bool,
    /// Categories that block unconditionally, regardless of confidence.
    pub child_safety_categories: BTreeSet<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(0.7, 0.5, true)
    }
}

impl Policy {
    /// Creates a policy. Thresholds are clamped to [0, 1] and the warn
    /// threshold is capped at the alert threshold so that
    /// `warn_threshold <= alert_threshold` always holds.
    pub fn new(alert_threshold: f32, warn_threshold: f32, block_policy_violations: bool) -> Self {
        let alert_threshold = alert_threshold.clamp(0.0, 1.0);
        let warn_threshold = warn_threshold.clamp(0.0, 1.0);
        if warn_threshold > alert_threshold {
            warn!(
                warn_threshold,
                alert_threshold, "warn threshold above alert threshold, capping"
            );
        }
        let mut child_safety_categories = BTreeSet::new();
        child_safety_categories.insert("child_safety".to_string());

        Self {
            alert_threshold,
            warn_threshold: warn_threshold.min(alert_threshold),
            block_policy_violations,
            child_safety_categories,
        }
    }

    /// Replaces the unconditional-block category set.
    pub fn with_child_safety_categories(
        mut self,
        categories: impl IntoIterator<Item = String>,
    ) -> Self {
        self.child_safety_categories = categories.into_iter().collect();
        self
    }

    /// Returns true if the category blocks unconditionally.
    pub fn is_child_safety(&self, category: &str) -> bool {
        self.child_safety_categories.contains(category)
    }
}

/// A decision paired with what triggered it, as delivered to channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Session the turn belongs to.
    pub session_id: String,
    /// The verdict.
    pub decision: Decision,
    /// The detections behind the verdict.
    pub detections: Vec<Detection>,
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    /// Creates an event stamped with the current time.
    pub fn new(session_id: impl Into<String>, decision: Decision, detections: Vec<Detection>) -> Self {
        Self {
            session_id: session_id.into(),
            decision,
            detections,
            timestamp: Utc::now(),
        }
    }
}

/// Errors raised by alert channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel could not write its destination.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The event could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The channel's receiver is gone.
    #[error("notifier receiver dropped")]
    ReceiverGone,
}

/// One alert delivery target.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name, used in dispatch failure logs.
    fn name(&self) -> &str;

    /// Delivers one event.
    async fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError>;
}

/// Append-only JSONL alert log.
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    /// Creates a log channel writing to the given path. Parent
    /// directories are created on first delivery.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the log path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl AlertChannel for AlertLog {
    fn name(&self) -> &str {
        "alert_log"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let json = serde_json::to_string(event)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory alert counters by action and by category.
#[derive(Debug, Default, Clone)]
pub struct AlertCounters {
    inner: Arc<RwLock<CounterState>>,
}

#[derive(Debug, Default)]
struct CounterState {
    by_action: std::collections::BTreeMap<String, u64>,
    by_category: std::collections::BTreeMap<String, u64>,
}

impl AlertCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count for an action name ("allow"/"warn"/"block").
    pub fn action_count(&self, action: Action) -> u64 {
        let state = self.inner.read().unwrap();
        state
            .by_action
            .get(action.name())
            .copied()
            .unwrap_or(0)
    }

    /// Returns the count for a category.
    pub fn category_count(&self, category: &str) -> u64 {
        let state = self.inner.read().unwrap();
        state.by_category.get(category).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AlertChannel for AlertCounters {
    fn name(&self) -> &str {
        "counters"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let mut state = self.inner.write().unwrap();
        *state
            .by_action
            .entry(event.decision.action.name().to_string())
            .or_insert(0) += 1;
        for detection in &event.detections {
            *state
                .by_category
                .entry(detection.category.clone())
                .or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Forwards events to an external notifier over a channel.
pub struct Notifier {
    sender: tokio::sync::mpsc::Sender<AlertEvent>,
}

impl Notifier {
    /// Creates a notifier channel backed by the given sender.
    pub fn new(sender: tokio::sync::mpsc::Sender<AlertEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl AlertChannel for Notifier {
    fn name(&self) -> &str {
        "notifier"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| ChannelError::ReceiverGone)
    }
}

/// Applies the policy to detection batches and fans decisions out.
pub struct AlertDispatcher {
    policy: Policy,
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl AlertDispatcher {
    /// Creates a dispatcher with no channels.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            channels: Vec::new(),
        }
    }

    /// Adds a delivery channel.
    pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Returns the policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Folds a batch of detections into a verdict.
    ///
    /// A child-safety category match blocks unconditionally, whatever
    /// its confidence. Otherwise the maximum confidence in the batch is
    /// compared against the thresholds.
    pub fn decide(&self, detections: &[Detection]) -> Decision {
        if detections.is_empty() {
            return Decision::allow();
        }

        let reasons: Vec<String> = detections.iter().map(|d| d.rule_id.clone()).collect();

        if detections
            .iter()
            .any(|d| self.policy.is_child_safety(&d.category))
        {
            return Decision::block(reasons);
        }

        let max_confidence = detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0_f32, f32::max);

        if max_confidence >= self.policy.alert_threshold && self.policy.block_policy_violations {
            Decision::block(reasons)
        } else if max_confidence >= self.policy.warn_threshold {
            Decision {
                action: Action::Warn,
                reasons,
            }
        } else {
            Decision::allow()
        }
    }

    /// Delivers an event to every channel, best-effort.
    ///
    /// A failing channel is logged and skipped; the remaining channels
    /// still receive the event. Returns the number of deliveries that
    /// succeeded.
    pub async fn dispatch(&self, event: &AlertEvent) -> usize {
        let mut delivered = 0;
        for channel in &self.channels {
            match channel.deliver(event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(channel = channel.name(), session_id = %event.session_id,
                          error = %e, "alert channel delivery failed");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::Severity;

    fn detection(rule_id: &str, category: &str, confidence: f32) -> Detection {
        Detection {
            rule_id: rule_id.to_string(),
            title: rule_id.to_string(),
            category: category.to_string(),
            severity: Severity::Medium,
            confidence,
            description: String::new(),
            matched_snippet: "snippet".to_string(),
            recommendation: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn dispatcher() -> AlertDispatcher {
        AlertDispatcher::new(Policy::default())
    }

    // === Policy ===

    #[test]
    fn policy_caps_warn_at_alert_threshold() {
        let policy = Policy::new(0.6, 0.9, true);
        assert!(policy.warn_threshold <= policy.alert_threshold);
        assert_eq!(policy.warn_threshold, 0.6);
    }

    #[test]
    fn policy_clamps_thresholds() {
        let policy = Policy::new(1.5, -0.3, true);
        assert_eq!(policy.alert_threshold, 1.0);
        assert_eq!(policy.warn_threshold, 0.0);
    }

    // === decide ===

    #[test]
    fn empty_detections_allow() {
        assert!(dispatcher().decide(&[]).should_allow());
    }

    #[test]
    fn below_warn_threshold_allows() {
        let decision = dispatcher().decide(&[detection("r1", "hacking", 0.3)]);
        assert!(decision.should_allow());
    }

    #[test]
    fn between_thresholds_warns() {
        let decision = dispatcher().decide(&[detection("r1", "hacking", 0.6)]);
        assert!(decision.should_warn());
        assert_eq!(decision.reasons, vec!["r1"]);
    }

    #[test]
    fn at_alert_threshold_blocks() {
        let decision = dispatcher().decide(&[detection("r1", "hacking", 0.7)]);
        assert!(decision.should_block());
    }

    #[test]
    fn alert_threshold_without_block_policy_warns() {
        let dispatcher = AlertDispatcher::new(Policy::new(0.7, 0.5, false));
        let decision = dispatcher.decide(&[detection("r1", "hacking", 0.9)]);
        assert!(decision.should_warn());
    }

    #[test]
    fn child_safety_blocks_regardless_of_confidence() {
        let decision = dispatcher().decide(&[detection("cs1", "child_safety", 0.1)]);
        assert!(decision.should_block());
        assert_eq!(decision.reasons, vec!["cs1"]);
    }

    #[test]
    fn child_safety_with_other_detections_blocks_with_all_reasons() {
        let decision = dispatcher().decide(&[
            detection("r1", "hacking", 0.8),
            detection("cs1", "child_safety", 0.95),
        ]);
        assert!(decision.should_block());
        assert_eq!(decision.reasons, vec!["r1", "cs1"]);
    }

    #[test]
    fn max_confidence_drives_verdict() {
        let decision = dispatcher().decide(&[
            detection("r1", "hacking", 0.2),
            detection("r2", "hacking", 0.6),
            detection("r3", "hacking", 0.1),
        ]);
        assert!(decision.should_warn());
    }

    #[test]
    fn custom_child_safety_categories() {
        let policy = Policy::default()
            .with_child_safety_categories(["minor_harm".to_string()]);
        let dispatcher = AlertDispatcher::new(policy);

        let decision = dispatcher.decide(&[detection("m1", "minor_harm", 0.05)]);
        assert!(decision.should_block());

        // The default set was replaced.
        let decision = dispatcher.decide(&[detection("cs1", "child_safety", 0.05)]);
        assert!(decision.should_allow());
    }

    // === dispatch ===

    struct FailingChannel;

    #[async_trait]
    impl AlertChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &AlertEvent) -> Result<(), ChannelError> {
            Err(ChannelError::Io(std::io::Error::other("down")))
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_others() {
        let counters = AlertCounters::new();
        let dispatcher = AlertDispatcher::new(Policy::default())
            .with_channel(Arc::new(FailingChannel))
            .with_channel(Arc::new(counters.clone()));

        let event = AlertEvent::new(
            "s1",
            Decision::block(vec!["r1".to_string()]),
            vec![detection("r1", "hacking", 0.9)],
        );
        let delivered = dispatcher.dispatch(&event).await;

        assert_eq!(delivered, 1);
        assert_eq!(counters.action_count(Action::Block), 1);
        assert_eq!(counters.category_count("hacking"), 1);
    }

    #[tokio::test]
    async fn alert_log_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts").join("alerts.jsonl");
        let log = AlertLog::new(&path);

        let event = AlertEvent::new(
            "s1",
            Decision::block(vec!["r1".to_string()]),
            vec![detection("r1", "hacking", 0.9)],
        );
        log.deliver(&event).await.unwrap();
        log.deliver(&event).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AlertEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert!(parsed.decision.should_block());
    }

    #[tokio::test]
    async fn notifier_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let dispatcher =
            AlertDispatcher::new(Policy::default()).with_channel(Arc::new(Notifier::new(tx)));

        let event = AlertEvent::new("s1", Decision::allow(), Vec::new());
        assert_eq!(dispatcher.dispatch(&event).await, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.session_id, "s1");
    }
}
