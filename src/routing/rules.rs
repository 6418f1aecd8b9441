//! # Canary Rule Matching
//!
//! A rule set is a named, ordered list of [`CandidateRule`]s. The coordinator hands the
//! route's `rule_set` expression to a [`RuleMatcher`] and only consumes the names of the
//! rules whose predicate holds; those names are then compared against instance metadata.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! let matcher = PredicateRuleMatcher::new()
//!     .with_rule("users-canary", CandidateRule::header_equals("beta", "x-canary", "beta"));
//! let matched = matcher.match_rules(&request, "users-canary").await;
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::types::RequestContext;

type Predicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// Answers which canary rules apply to a request
#[async_trait]
pub trait RuleMatcher: Send + Sync {
    /// Names of the rules in `rule_set` that match `request`, in rule order
    async fn match_rules(&self, request: &RequestContext, rule_set: &str) -> Vec<String>;
}

/// Rule name plus the predicate deciding membership
#[derive(Clone)]
pub struct CandidateRule {
    pub name: String,
    predicate: Predicate,
}

impl CandidateRule {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Matches when `header` is present and equals `value` (ASCII case-insensitive)
    pub fn header_equals(name: impl Into<String>, header: &str, value: &str) -> Self {
        let header = header.to_ascii_lowercase();
        let value = value.to_string();
        Self::new(name, move |request| {
            request
                .header(&header)
                .map(|actual| actual.eq_ignore_ascii_case(&value))
                .unwrap_or(false)
        })
    }

    /// Matches every request
    pub fn always(name: impl Into<String>) -> Self {
        Self::new(name, |_| true)
    }

    pub fn matches(&self, request: &RequestContext) -> bool {
        (self.predicate)(request)
    }
}

impl fmt::Debug for CandidateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateRule").field("name", &self.name).finish()
    }
}

/// Rule matcher backed by in-process predicates
///
/// Unknown rule sets match nothing.
#[derive(Debug, Clone, Default)]
pub struct PredicateRuleMatcher {
    rule_sets: HashMap<String, Vec<CandidateRule>>,
}

impl PredicateRuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `rule` to `rule_set`
    pub fn add_rule(&mut self, rule_set: impl Into<String>, rule: CandidateRule) {
        self.rule_sets.entry(rule_set.into()).or_default().push(rule);
    }

    /// Builder-style variant of [`add_rule`](Self::add_rule)
    pub fn with_rule(mut self, rule_set: impl Into<String>, rule: CandidateRule) -> Self {
        self.add_rule(rule_set, rule);
        self
    }

    /// Rules of a set, in evaluation order
    pub fn rules(&self, rule_set: &str) -> &[CandidateRule] {
        self.rule_sets
            .get(rule_set)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[async_trait]
impl RuleMatcher for PredicateRuleMatcher {
    async fn match_rules(&self, request: &RequestContext, rule_set: &str) -> Vec<String> {
        self.rules(rule_set)
            .iter()
            .filter(|rule| rule.matches(request))
            .map(|rule| rule.name.clone())
            .collect()
    }
}
