//! Deterministic rule evaluation over a single conversational turn.
//!
//! Evaluation is pure: no state is mutated, every rule is evaluated
//! independently with no short-circuiting, and an identical (rule set,
//! turn) pair always yields an identical ordered detection list. That
//! makes concurrent evaluation across sessions safe without any
//! coordination.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::patterns::{Matcher, PatternStore, Rule, RuleScope, Severity};

/// The result of a rule firing against a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Id of the rule that fired.
    #[serde(rename = "safeguard_id")]
    pub rule_id: String,
    /// Rule title.
    pub title: String,
    /// Category the rule reports under.
    pub category: String,
    /// Harm ranking of the rule.
    pub severity: Severity,
    /// Stated match reliability in [0, 1].
    pub confidence: f32,
    /// What the rule detects.
    pub description: String,
    /// The text that triggered the match.
    #[serde(rename = "matched_pattern")]
    pub matched_snippet: String,
    /// Suggested follow-up.
    pub recommendation: String,
    /// When the detection was produced.
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    fn from_rule(rule: &Rule, snippet: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id.clone(),
            title: rule.name.clone(),
            category: rule.category.clone(),
            severity: rule.severity,
            confidence: rule.confidence,
            description: rule.description.clone(),
            matched_snippet: snippet,
            recommendation: rule.recommendation.clone(),
            timestamp,
        }
    }
}

/// Evaluates turns against a pattern store.
///
/// Cheap to clone; the store is shared.
#[derive(Clone)]
pub struct DetectionEngine {
    store: Arc<PatternStore>,
    /// Per-category kill switches; a category absent from the map is on.
    active_safeguards: BTreeMap<String, bool>,
}

impl DetectionEngine {
    /// Creates an engine over the given store with all categories active.
    pub fn new(store: Arc<PatternStore>) -> Self {
        Self {
            store,
            active_safeguards: BTreeMap::new(),
        }
    }

    /// Sets the per-category kill switches.
    pub fn with_safeguards(mut self, safeguards: BTreeMap<String, bool>) -> Self {
        self.active_safeguards = safeguards;
        self
    }

    /// Returns the shared pattern store.
    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    /// Returns true if the category participates in evaluation.
    pub fn is_active(&self, category: &str) -> bool {
        self.active_safeguards.get(category).copied().unwrap_or(true)
    }

    /// Evaluates one turn and returns every detection, in rule order.
    ///
    /// A rule whose matcher fails (a panicking predicate) is skipped
    /// and the remaining rules still run.
    pub fn evaluate(&self, user_message: &str, assistant_response: &str) -> Vec<Detection> {
        let now = Utc::now();
        let user_lower = user_message.to_lowercase();
        let response_lower = assistant_response.to_lowercase();

        let user_pair = (user_message, user_lower.as_str());
        let response_pair = (assistant_response, response_lower.as_str());
        let both_pairs = [user_pair, response_pair];

        let mut detections = Vec::new();

        for compiled in self.store.compiled() {
            let rule = &compiled.rule;
            if !rule.enabled || !self.is_active(&rule.category) {
                continue;
            }

            let texts: &[(&str, &str)] = match rule.scope {
                RuleScope::UserMessage => std::slice::from_ref(&user_pair),
                RuleScope::Response => std::slice::from_ref(&response_pair),
                RuleScope::Both => &both_pairs,
            };

            for &(text, lower) in texts {
                match try_match(&compiled.matcher, text, lower) {
                    Ok(Some(snippet)) => {
                        detections.push(Detection::from_rule(rule, snippet, now));
                        break;
                    }
                    Ok(None) => {}
                    Err(()) => {
                        error!(rule_id = %rule.id, "rule evaluation failed, skipping rule");
                        break;
                    }
                }
            }
        }

        detections
    }
}

/// Runs one matcher over one text. Predicate panics are contained and
/// reported as a per-rule failure.
fn try_match(
    matcher: &Matcher,
    text: &str,
    lower: &str,
) -> std::result::Result<Option<String>, ()> {
    match matcher {
        Matcher::Regex(regex) => Ok(regex.find(text).map(|m| m.as_str().to_string())),
        Matcher::Substring(needle) => {
            Ok(lower.contains(needle.as_str()).then(|| needle.clone()))
        }
        Matcher::Predicate(predicate) => {
            catch_unwind(AssertUnwindSafe(|| predicate(text))).map_err(|_| ())
        }
    }
}
