//! Label matching against silence matchers.
//!
//! The engine is the hot path of alert ingestion: it never fails and never
//! blocks on anything but the regex cache's lock. Patterns are compiled once
//! and shared by every later evaluation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{MatchType, Matcher, Silence};

/// Compiles a matcher pattern, anchored at both ends like Alertmanager.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// How many matching silences to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Stop at the first silence that matches.
    FirstMatch,
    /// Evaluate every silence and report all matches.
    #[default]
    AllMatches,
}

/// The outcome of evaluating a label set against silences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SilenceDecision {
    /// Whether at least one silence matched.
    pub silenced: bool,
    /// IDs of the matching silences, in evaluation order.
    pub matched_ids: Vec<String>,
    /// Evaluation was cancelled; the decision fell back to "not silenced".
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl SilenceDecision {
    /// A decision that silences nothing.
    #[must_use]
    pub fn not_silenced() -> Self {
        Self::default()
    }

    fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::default()
        }
    }
}

/// Compiled regexes keyed by pattern.
///
/// The cache only grows; distinct patterns are bounded by the silences seen.
#[derive(Debug, Default)]
pub struct RegexCache {
    patterns: RwLock<HashMap<String, Option<Regex>>>,
}

impl RegexCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the compiled form of `pattern`, compiling it on first sight.
    ///
    /// `f` receives `None` if the pattern does not compile; the failure is
    /// remembered so it is logged once.
    pub fn with_compiled<R>(&self, pattern: &str, f: impl FnOnce(Option<&Regex>) -> R) -> R {
        {
            let patterns = self.patterns.read();
            if let Some(compiled) = patterns.get(pattern) {
                return f(compiled.as_ref());
            }
        }

        let compiled = match compile_pattern(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "matcher pattern failed to compile");
                None
            }
        };

        let mut patterns = self.patterns.write();
        let entry = patterns.entry(pattern.to_string()).or_insert(compiled);
        let result = f(entry.as_ref());
        debug!(pattern = %pattern, cached = patterns.len(), "compiled matcher pattern");
        result
    }

    /// Runs `pattern` against `value`. A pattern that does not compile never matches.
    pub fn is_match(&self, pattern: &str, value: &str) -> bool {
        self.with_compiled(pattern, |re| re.is_some_and(|re| re.is_match(value)))
    }

    /// Compiles every regex matcher ahead of the first evaluation.
    pub fn warm<'a>(&self, matchers: impl IntoIterator<Item = &'a Matcher>) {
        for matcher in matchers.into_iter().filter(|m| m.is_regex()) {
            self.with_compiled(&matcher.value, |_| ());
        }
    }

    /// Returns the number of cached patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    /// Returns true if nothing has been compiled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

/// Evaluates label sets against matchers and silences.
#[derive(Debug, Clone, Default)]
pub struct MatcherEngine {
    regexes: Arc<RegexCache>,
}

impl MatcherEngine {
    /// Creates an engine with an empty regex cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared regex cache.
    #[must_use]
    pub fn regex_cache(&self) -> &RegexCache {
        &self.regexes
    }

    /// Returns the number of distinct compiled patterns.
    #[must_use]
    pub fn cached_patterns(&self) -> usize {
        self.regexes.len()
    }

    /// Evaluates one matcher against a label set.
    #[must_use]
    pub fn matches_one(&self, labels: &HashMap<String, String>, matcher: &Matcher) -> bool {
        let value = labels.get(&matcher.name);
        match matcher.match_type {
            MatchType::Equal => value.is_some_and(|v| *v == matcher.value),
            MatchType::NotEqual => value.is_none_or(|v| *v != matcher.value),
            MatchType::Regex => {
                value.is_some_and(|v| self.regexes.is_match(&matcher.value, v))
            }
            MatchType::NotRegex => match value {
                None => true,
                // A broken pattern must not widen the silence.
                Some(v) => self
                    .regexes
                    .with_compiled(&matcher.value, |re| re.is_some_and(|re| !re.is_match(v))),
            },
        }
    }

    /// Returns true iff every matcher holds for `labels`.
    ///
    /// An empty matcher list never reaches the engine; validation rejects it.
    #[must_use]
    pub fn matches(&self, labels: &HashMap<String, String>, matchers: &[Matcher]) -> bool {
        matchers.iter().all(|m| self.matches_one(labels, m))
    }

    /// Evaluates `labels` against each silence's matchers.
    ///
    /// The caller is responsible for passing only silences that are active.
    /// Cancellation is checked between silences; a cancelled evaluation
    /// reports "not silenced".
    pub fn is_silenced<'a>(
        &self,
        labels: &HashMap<String, String>,
        silences: impl IntoIterator<Item = &'a Silence>,
        cancel: &CancellationToken,
        mode: MatchMode,
    ) -> SilenceDecision {
        let mut decision = SilenceDecision::not_silenced();

        for silence in silences {
            if cancel.is_cancelled() {
                debug!(
                    evaluated_matches = decision.matched_ids.len(),
                    "silence evaluation cancelled"
                );
                return SilenceDecision::interrupted();
            }

            if self.matches(labels, &silence.matchers) {
                decision.silenced = true;
                decision.matched_ids.push(silence.id.clone());
                if mode == MatchMode::FirstMatch {
                    break;
                }
            }
        }

        decision
    }
}
