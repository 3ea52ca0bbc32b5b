//! Detection rules and the store that loads and compiles them.
//!
//! Rules are loaded from JSON sources (an array of rule records, or an
//! id-keyed map of them) and merged into a single ordered store. A
//! malformed source is skipped with a warning; a malformed rule inside
//! a healthy source is skipped individually. Duplicate ids: the rule
//! loaded last wins.
//!
//! Regex rules are compiled once at load time and cached; compilation
//! happens nowhere near the evaluation path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::predicates::{PredicateFn, PredicateRegistry};

/// Default recommendation attached to rules that do not carry one.
pub const DEFAULT_RECOMMENDATION: &str = "Review for possible policy violation";

/// Errors raised while loading rule sources.
#[derive(Debug, Error)]
pub enum PatternError {
    /// Rule source could not be read.
    #[error("failed to read rule source {}: {source}", path.display())]
    Io {
        /// Path of the offending source.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Rule source is not valid JSON of either accepted shape.
    #[error("failed to parse rule source {}: {source}", path.display())]
    Parse {
        /// Path of the offending source.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Rule has no id.
    #[error("rule is missing an id")]
    MissingId,

    /// Rule has an empty pattern.
    #[error("rule {0} has an empty pattern")]
    EmptyPattern(String),

    /// Regex pattern failed to compile.
    #[error("rule {id} has an invalid regex: {source}")]
    InvalidRegex {
        /// Id of the offending rule.
        id: String,
        /// Underlying regex error.
        source: regex::Error,
    },

    /// Predicate rule names an unregistered predicate.
    #[error("rule {id} references unknown predicate {name}")]
    UnknownPredicate {
        /// Id of the offending rule.
        id: String,
        /// The unresolved predicate name.
        name: String,
    },
}

/// Result type for pattern operations.
pub type Result<T> = std::result::Result<T, PatternError>;

/// Qualitative harm ranking attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Low-harm content.
    Low,
    /// Moderate-harm content.
    #[default]
    Medium,
    /// High-harm content.
    High,
}

impl Severity {
    /// Returns all severities.
    pub fn all() -> &'static [Severity] {
        &[Severity::Low, Severity::Medium, Severity::High]
    }

    /// Returns the severity as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// How a rule matches text. Closed set: adding a variant is a compile
/// error everywhere matching is implemented, never a silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Case-insensitive regex search.
    Regex,
    /// Case-insensitive substring containment.
    Substring,
    /// Dispatch to a registered named predicate.
    NamedPredicate,
}

/// Which side(s) of a turn a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Only the user message.
    UserMessage,
    /// Only the assistant response.
    #[default]
    Response,
    /// Both sides of the turn.
    Both,
}

/// A single detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for this rule.
    pub id: String,
    /// Human-readable title shown in alerts.
    #[serde(default)]
    pub name: String,
    /// How this rule matches.
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Pattern text, or predicate name for named-predicate rules.
    pub pattern: String,
    /// Which side(s) of the turn this rule inspects.
    #[serde(default)]
    pub scope: RuleScope,
    /// Category the rule reports under (e.g. "hacking", "child_safety").
    #[serde(default = "default_category")]
    pub category: String,
    /// Harm ranking.
    #[serde(default)]
    pub severity: Severity,
    /// Stated match reliability in [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// What the rule detects.
    #[serde(default)]
    pub description: String,
    /// Suggested follow-up when the rule fires.
    #[serde(default = "default_recommendation")]
    pub recommendation: String,
    /// Whether the rule participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_category() -> String {
    "policy_violation".to_string()
}

fn default_confidence() -> f32 {
    0.8
}

fn default_recommendation() -> String {
    DEFAULT_RECOMMENDATION.to_string()
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Creates a regex rule.
    pub fn regex(
        id: impl Into<String>,
        pattern: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self::new(id, RuleKind::Regex, pattern, category)
    }

    /// Creates a substring rule.
    pub fn substring(
        id: impl Into<String>,
        pattern: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self::new(id, RuleKind::Substring, pattern, category)
    }

    /// Creates a named-predicate rule.
    pub fn predicate(
        id: impl Into<String>,
        predicate_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self::new(id, RuleKind::NamedPredicate, predicate_name, category)
    }

    fn new(
        id: impl Into<String>,
        kind: RuleKind,
        pattern: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            pattern: pattern.into(),
            scope: RuleScope::default(),
            category: category.into(),
            severity: Severity::default(),
            confidence: default_confidence(),
            description: String::new(),
            recommendation: default_recommendation(),
            enabled: true,
        }
    }

    /// Sets the human-readable title.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets whether the rule is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// How a compiled rule performs its match.
pub(crate) enum Matcher {
    /// Pre-compiled case-insensitive regex.
    Regex(Regex),
    /// Lowercased needle for containment checks.
    Substring(String),
    /// Resolved predicate function.
    Predicate(PredicateFn),
}

/// A rule paired with its compiled matcher.
pub(crate) struct CompiledRule {
    pub(crate) rule: Rule,
    pub(crate) matcher: Matcher,
}

/// Ordered, id-keyed store of compiled detection rules.
///
/// Evaluation order is load order, which makes detection lists
/// deterministic for a fixed store.
pub struct PatternStore {
    compiled: Vec<CompiledRule>,
    index: HashMap<String, usize>,
    registry: PredicateRegistry,
    regex_cache: HashMap<String, Regex>,
}

impl PatternStore {
    /// Creates an empty store with the built-in predicate registry.
    pub fn new() -> Self {
        Self::with_registry(PredicateRegistry::builtin())
    }

    /// Creates an empty store with a custom predicate registry.
    pub fn with_registry(registry: PredicateRegistry) -> Self {
        Self {
            compiled: Vec::new(),
            index: HashMap::new(),
            registry,
            regex_cache: HashMap::new(),
        }
    }

    /// Builds a store from a list of rules, skipping invalid ones.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let mut store = Self::new();
        for rule in rules {
            if let Err(e) = store.insert(rule) {
                warn!(error = %e, "skipping invalid rule");
            }
        }
        store
    }

    /// Loads and merges every source, skipping malformed ones.
    ///
    /// A source that cannot be read or parsed is logged and skipped;
    /// loading continues with the remaining sources.
    pub fn load(sources: &[PathBuf]) -> Self {
        let mut store = Self::new();
        for path in sources {
            if let Err(e) = store.merge_file(path) {
                warn!(path = %path.display(), error = %e, "skipping rule source");
            }
        }
        info!(rules = store.len(), "pattern store loaded");
        store
    }

    /// Loads every `.json` file in a directory, in name order.
    pub fn load_dir(dir: &Path) -> Self {
        let mut sources = Vec::new();
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        sources.push(path);
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read patterns directory");
            }
        }
        sources.sort();
        Self::load(&sources)
    }

    /// Merges one rule file into the store.
    ///
    /// Accepts either a JSON array of rules or an id-keyed map of rule
    /// bodies. Individual invalid rules are skipped with a warning.
    pub fn merge_file(&mut self, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path).map_err(|source| PatternError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let entries = parse_rule_source(&raw).map_err(|source| PatternError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut loaded = 0;
        for value in entries {
            let rule: Rule = match serde_json::from_value(value) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed rule");
                    continue;
                }
            };
            let id = rule.id.clone();
            match self.insert(rule) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    warn!(path = %path.display(), rule_id = %id, error = %e, "skipping rule");
                }
            }
        }

        info!(path = %path.display(), loaded, "loaded rule source");
        Ok(loaded)
    }

    /// Validates, compiles, and inserts a rule. Last insert wins on a
    /// duplicate id, replacing the earlier rule in place.
    pub fn insert(&mut self, rule: Rule) -> Result<()> {
        Self::validate(&rule)?;
        let matcher = self.compile(&rule)?;
        let compiled = CompiledRule { rule, matcher };

        match self.index.get(&compiled.rule.id) {
            Some(&pos) => {
                warn!(rule_id = %compiled.rule.id, "duplicate rule id, last loaded wins");
                self.compiled[pos] = compiled;
            }
            None => {
                self.index
                    .insert(compiled.rule.id.clone(), self.compiled.len());
                self.compiled.push(compiled);
            }
        }
        Ok(())
    }

    /// Rejects rules lacking an id or a non-empty pattern.
    pub fn validate(rule: &Rule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(PatternError::MissingId);
        }
        if rule.pattern.trim().is_empty() {
            return Err(PatternError::EmptyPattern(rule.id.clone()));
        }
        Ok(())
    }

    fn compile(&mut self, rule: &Rule) -> Result<Matcher> {
        match rule.kind {
            RuleKind::Regex => {
                if let Some(cached) = self.regex_cache.get(&rule.pattern) {
                    return Ok(Matcher::Regex(cached.clone()));
                }
                if has_nested_quantifier(&rule.pattern) {
                    // The regex crate runs in linear time, but flag the
                    // pattern anyway: it is almost always authoring error.
                    warn!(rule_id = %rule.id, pattern = %rule.pattern,
                          "regex has nested quantifiers, potential pathological pattern");
                }
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|source| PatternError::InvalidRegex {
                        id: rule.id.clone(),
                        source,
                    })?;
                self.regex_cache.insert(rule.pattern.clone(), regex.clone());
                Ok(Matcher::Regex(regex))
            }
            RuleKind::Substring => Ok(Matcher::Substring(rule.pattern.to_lowercase())),
            RuleKind::NamedPredicate => {
                let matcher = self.registry.resolve(&rule.pattern).ok_or_else(|| {
                    PatternError::UnknownPredicate {
                        id: rule.id.clone(),
                        name: rule.pattern.clone(),
                    }
                })?;
                Ok(Matcher::Predicate(matcher))
            }
        }
    }

    /// Returns the number of loaded rules.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Returns true if the store holds no rules.
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Returns the rule with the given id.
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.index.get(id).map(|&pos| &self.compiled[pos].rule)
    }

    /// Iterates over rules in load order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.compiled.iter().map(|c| &c.rule)
    }

    /// Iterates over rules of one kind, in load order.
    pub fn rules_of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &Rule> {
        self.rules().filter(move |r| r.kind == kind)
    }

    pub(crate) fn compiled(&self) -> &[CompiledRule] {
        &self.compiled
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a rule source into raw rule records. Accepts a JSON array of
/// rules, or a map of id to rule body (the id key fills a missing `id`
/// field). Record-level validation happens later, one rule at a time.
fn parse_rule_source(
    raw: &str,
) -> std::result::Result<Vec<serde_json::Value>, serde_json::Error> {
    let root: serde_json::Value = serde_json::from_str(raw)?;
    match root {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            Ok(entries
                .into_iter()
                .map(|(id, mut body)| {
                    if let Some(obj) = body.as_object_mut() {
                        obj.entry("id").or_insert_with(|| id.into());
                    }
                    body
                })
                .collect())
        }
        other => Err(serde::de::Error::custom(format!(
            "expected array or object of rules, got {other}"
        ))),
    }
}

/// Detects quantified groups that are themselves quantified, e.g.
/// `(a+)+` or `(\w*)*`, the classic catastrophic-backtracking shapes.
fn has_nested_quantifier(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut quantified_depths: Vec<bool> = Vec::new();
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'(' => quantified_depths.push(false),
            b'+' | b'*' => {
                if let Some(top) = quantified_depths.last_mut() {
                    *top = true;
                }
            }
            b')' => {
                let had_quantifier = quantified_depths.pop().unwrap_or(false);
                let next = bytes.get(i + 1);
                if had_quantifier && matches!(next, Some(b'+') | Some(b'*') | Some(b'{')) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}
