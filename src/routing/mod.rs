pub mod rules;

pub use rules::{CandidateRule, PredicateRuleMatcher, RuleMatcher};
