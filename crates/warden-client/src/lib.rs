//! Warden Client - the in-client enforcement point.
//!
//! The guard runs the same decision pipeline as the network monitor,
//! either in-process or by delegating over the wire protocol, so the
//! two enforcement points cannot drift apart. `pre_check` gates the
//! outbound user message before it reaches the backend; `post_check`
//! gates the model response before it reaches the user. Both are
//! synchronous gates: the surrounding call must not proceed until the
//! verdict (including any fallback resolution) is in.

pub mod remote;

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use warden_core::dispatch::AlertEvent;
use warden_core::{
    AlertDispatcher, Decision, Detection, DetectionEngine, FallbackMode, SessionRegistry,
};

pub use remote::RemoteAnalyzer;

/// Fixed reply returned in place of a blocked user message.
pub const SYNTHETIC_REFUSAL: &str =
    "I can't help with that request. It conflicts with the configured safety policy.";

/// Fixed marker substituted for a blocked model response.
pub const WITHHELD_MARKER: &str = "[Response withheld due to policy violation]";

/// Reason attached to fail-closed blocks.
pub const UNREACHABLE_REASON: &str = "monitor_unreachable";

/// Errors raised by the client guard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The remote monitor could not be reached.
    #[error("monitor unreachable: {0}")]
    BackendUnreachable(#[source] std::io::Error),

    /// The remote monitor sent something that is not the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote monitor reported an error payload.
    #[error("monitor error: {0}")]
    Remote(String),
}

/// Result type for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// The outcome of analyzing one side of a turn.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    /// Detections the text produced.
    pub detections: Vec<Detection>,
    /// The verdict.
    pub decision: Decision,
}

/// Where analysis happens: in-process, or a remote monitor.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyzes one turn (either side may be empty) and returns the
    /// detections with the verdict.
    async fn analyze(
        &self,
        session_id: &str,
        user_message: &str,
        model_response: &str,
    ) -> Result<AnalysisReport>;
}

/// In-process analyzer over the shared core pipeline.
pub struct LocalAnalyzer {
    engine: Arc<DetectionEngine>,
    dispatcher: Arc<AlertDispatcher>,
    registry: SessionRegistry,
}

impl LocalAnalyzer {
    /// Creates a local analyzer.
    pub fn new(
        engine: Arc<DetectionEngine>,
        dispatcher: Arc<AlertDispatcher>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            registry,
        }
    }
}

#[async_trait]
impl Analyzer for LocalAnalyzer {
    async fn analyze(
        &self,
        session_id: &str,
        user_message: &str,
        model_response: &str,
    ) -> Result<AnalysisReport> {
        self.registry.open(Some(session_id));
        let detections = self.engine.evaluate(user_message, model_response);

        if let Err(e) =
            self.registry
                .record_turn(session_id, user_message, model_response, detections.clone())
        {
            warn!(session_id = %session_id, error = %e, "failed to record turn locally");
        }

        let decision = self.dispatcher.decide(&detections);
        if !detections.is_empty() {
            let event = AlertEvent::new(session_id, decision.clone(), detections.clone());
            self.dispatcher.dispatch(&event).await;
        }

        Ok(AnalysisReport {
            detections,
            decision,
        })
    }
}

/// Per-conversation enforcement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Turns on which at least one detection fired.
    pub policy_enforcements: u64,
    /// Detections in a child-safety category.
    pub child_safety_triggers: u64,
}

/// Gates user messages and model responses through an analyzer.
pub struct ClientGuard {
    analyzer: Arc<dyn Analyzer>,
    fallback: FallbackMode,
    session_id: String,
    child_safety_categories: BTreeSet<String>,
    stats: RwLock<GuardStats>,
}

impl ClientGuard {
    /// Creates a guard over the given analyzer with a fresh session id.
    ///
    /// The fallback mode is mandatory: unreachable-monitor behavior is
    /// always an explicit configuration decision.
    pub fn new(analyzer: Arc<dyn Analyzer>, fallback: FallbackMode) -> Self {
        let mut child_safety_categories = BTreeSet::new();
        child_safety_categories.insert("child_safety".to_string());

        Self {
            analyzer,
            fallback,
            session_id: Uuid::new_v4().to_string(),
            child_safety_categories,
            stats: RwLock::new(GuardStats::default()),
        }
    }

    /// Replaces the session id (e.g. to resume a conversation).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Replaces the categories counted as child-safety triggers.
    pub fn with_child_safety_categories(
        mut self,
        categories: impl IntoIterator<Item = String>,
    ) -> Self {
        self.child_safety_categories = categories.into_iter().collect();
        self
    }

    /// Returns the guard's session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns a copy of the enforcement counters.
    pub fn stats(&self) -> GuardStats {
        *self.stats.read().unwrap()
    }

    /// Gates a user message before it is sent to the backend.
    ///
    /// A block verdict means the message must not reach the backend;
    /// use [`SYNTHETIC_REFUSAL`] in place of a model reply.
    pub async fn pre_check(&self, user_message: &str) -> Decision {
        self.check(user_message, "").await
    }

    /// Gates a model response after it arrives from the backend.
    ///
    /// A block verdict means the response must be replaced with
    /// [`WITHHELD_MARKER`]; a warn verdict passes it through after
    /// logging an alert.
    pub async fn post_check(&self, model_response: &str) -> Decision {
        let decision = self.check("", model_response).await;
        if decision.should_warn() {
            warn!(
                session_id = %self.session_id,
                reasons = ?decision.reasons,
                "response passed with warning"
            );
        }
        decision
    }

    /// Applies a post-check verdict to the response text.
    pub fn apply_to_response(decision: &Decision, model_response: &str) -> String {
        if decision.should_block() {
            WITHHELD_MARKER.to_string()
        } else {
            model_response.to_string()
        }
    }

    async fn check(&self, user_message: &str, model_response: &str) -> Decision {
        match self
            .analyzer
            .analyze(&self.session_id, user_message, model_response)
            .await
        {
            Ok(report) => {
                self.track(&report);
                report.decision
            }
            Err(e) => self.resolve_fallback(&e),
        }
    }

    fn track(&self, report: &AnalysisReport) {
        if report.detections.is_empty() {
            return;
        }
        let mut stats = self.stats.write().unwrap();
        stats.policy_enforcements += 1;
        stats.child_safety_triggers += report
            .detections
            .iter()
            .filter(|d| self.child_safety_categories.contains(&d.category))
            .count() as u64;
    }

    /// Resolves an analyzer failure through the configured fallback.
    fn resolve_fallback(&self, error: &GuardError) -> Decision {
        match self.fallback {
            FallbackMode::FailOpen => {
                warn!(
                    session_id = %self.session_id,
                    error = %error,
                    "monitor unavailable, failing open"
                );
                Decision::allow()
            }
            FallbackMode::FailClosed => {
                info!(
                    session_id = %self.session_id,
                    error = %error,
                    "monitor unavailable, failing closed"
                );
                Decision::block(vec![UNREACHABLE_REASON.to_string()])
            }
        }
    }
}
