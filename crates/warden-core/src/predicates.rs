//! Named predicate matchers for rules that plain patterns cannot express.
//!
//! Predicate rules reference a matcher by name. The set of matchers is
//! closed: every name is registered here at startup, and a rule naming
//! an unregistered predicate is rejected when the rule set is loaded,
//! not silently skipped at evaluation time.

use std::collections::BTreeMap;

/// A predicate matcher. Returns the matched snippet when the text
/// triggers the predicate, `None` otherwise.
pub type PredicateFn = fn(&str) -> Option<String>;

/// Minimum length of a base64 run considered a smuggled payload.
const BASE64_RUN_MIN: usize = 120;

/// Minimum line length considered for repetition counting.
const REPEAT_LINE_MIN: usize = 12;

/// Number of identical lines that counts as looping output.
const REPEAT_COUNT: usize = 3;

/// Registry of named predicate matchers.
///
/// The registry is built once at startup and consulted when rules are
/// loaded. Lookup order is deterministic (names are kept sorted).
#[derive(Debug, Clone)]
pub struct PredicateRegistry {
    matchers: BTreeMap<&'static str, PredicateFn>,
}

impl PredicateRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            matchers: BTreeMap::new(),
        }
    }

    /// Creates a registry with the built-in predicate set.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("refusal_bypass_attempt", refusal_bypass_attempt);
        registry.register("excessive_repetition", excessive_repetition);
        registry.register("base64_payload", base64_payload);
        registry
    }

    /// Registers a matcher under the given name.
    pub fn register(&mut self, name: &'static str, matcher: PredicateFn) {
        self.matchers.insert(name, matcher);
    }

    /// Resolves a predicate by name.
    pub fn resolve(&self, name: &str) -> Option<PredicateFn> {
        self.matchers.get(name).copied()
    }

    /// Returns true if the named predicate is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.matchers.contains_key(name)
    }

    /// Returns the registered predicate names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.matchers.keys().copied().collect()
    }
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Detects attempts to push past an earlier refusal.
fn refusal_bypass_attempt(text: &str) -> Option<String> {
    const PHRASES: &[&str] = &[
        "ignore your previous refusal",
        "you already refused",
        "answer anyway",
        "try again without the warning",
        "pretend you never refused",
    ];

    let lower = text.to_lowercase();
    for phrase in PHRASES {
        if lower.contains(phrase) {
            return Some((*phrase).to_string());
        }
    }
    None
}

/// Detects looping output: the same non-trivial line repeated.
fn excessive_repetition(text: &str) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.len() < REPEAT_LINE_MIN {
            continue;
        }
        let count = counts.entry(line).or_insert(0);
        *count += 1;
        if *count >= REPEAT_COUNT {
            return Some(line.to_string());
        }
    }
    None
}

/// Detects long base64 runs that can smuggle content past text rules.
fn base64_payload(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut run_start = None;

    for (i, &b) in bytes.iter().enumerate() {
        let is_b64 = b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=';
        match (is_b64, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if i - start >= BASE64_RUN_MIN {
                    return Some(text[start..start + BASE64_RUN_MIN].to_string());
                }
                run_start = None;
            }
            _ => {}
        }
    }

    if let Some(start) = run_start {
        if bytes.len() - start >= BASE64_RUN_MIN {
            return Some(text[start..start + BASE64_RUN_MIN].to_string());
        }
    }
    None
}
