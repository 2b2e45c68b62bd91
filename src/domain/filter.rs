//! Incoming text-message filter pipeline
//!
//! Ordered rule entries evaluated top-to-bottom against the headers of an
//! inbound MESSAGE. Every predicate inside an entry must match (conjunction);
//! the first enabled matching entry decides. No match means accept-and-push.
//! The pipeline runs before any dialog state is allocated, so a rejection
//! never costs session memory.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single header match predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterPredicate {
    /// Header value equals the configured string exactly
    Equal { header: String, value: String },
    /// Header value contains the configured substring
    Contains { header: String, value: String },
    /// Header value parses as an unsigned integer greater than the threshold.
    /// A non-numeric value fails safe to non-match.
    UintGt { header: String, threshold: u64 },
}

impl FilterPredicate {
    /// Evaluate against a header list (names compared case-insensitively).
    pub fn matches(&self, headers: &[(String, String)]) -> bool {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        match self {
            FilterPredicate::Equal { header, value } => {
                lookup(header).map(|v| v.trim() == value).unwrap_or(false)
            }
            FilterPredicate::Contains { header, value } => {
                lookup(header).map(|v| v.contains(value.as_str())).unwrap_or(false)
            }
            FilterPredicate::UintGt { header, threshold } => match lookup(header) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(n) => n > *threshold,
                    Err(_) => {
                        debug!(header, value = raw, "non-numeric header in UintGt predicate, treating as non-match");
                        false
                    }
                },
                None => false,
            },
        }
    }
}

/// Action taken when a rule entry matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterAction {
    /// Answer 200 and discard the message silently
    AcceptAndDrop,
    /// Answer 200, keep the message, but raise no push
    AcceptAndDoNotPush,
    /// Refuse with the configured response
    Reject { code: u16, phrase: String },
}

/// One ordered filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub enabled: bool,
    pub predicates: Vec<FilterPredicate>,
    pub action: FilterAction,
}

impl FilterRule {
    /// An entry matches only if every predicate matches.
    pub fn matches(&self, headers: &[(String, String)]) -> bool {
        !self.predicates.is_empty() && self.predicates.iter().all(|p| p.matches(headers))
    }
}

/// Outcome of running the pipeline over one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Default: accept the message and wake the host
    AcceptAndPush,
    AcceptAndDrop,
    AcceptAndDoNotPush,
    Reject { code: u16, phrase: String },
}

/// Evaluate the ordered rule list; first enabled match wins.
pub fn evaluate(rules: &[FilterRule], headers: &[(String, String)]) -> FilterDecision {
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if rule.matches(headers) {
            return match &rule.action {
                FilterAction::AcceptAndDrop => FilterDecision::AcceptAndDrop,
                FilterAction::AcceptAndDoNotPush => FilterDecision::AcceptAndDoNotPush,
                FilterAction::Reject { code, phrase } => FilterDecision::Reject {
                    code: *code,
                    phrase: phrase.clone(),
                },
            };
        }
    }
    FilterDecision::AcceptAndPush
}
