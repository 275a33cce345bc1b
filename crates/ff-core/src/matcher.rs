//! Decision Engine
//!
//! Every page load and every rules broadcast goes through here. The engine is
//! a pure function of the URL and a rule set snapshot and never fails:
//! whatever it cannot evaluate is allowed.

use crate::types::{RuleSet, Verdict};
use crate::url::{extract_host, normalize_host};

/// Decide whether `url` is blocked under `rules`.
///
/// 1. A disabled rule set blocks nothing.
/// 2. Non-web and malformed URLs are allowed.
/// 3. The host is normalized by stripping a leading `www.` only and looked up
///    exactly; listing `youtube.com` does not block `m.youtube.com`.
pub fn decide(url: &str, rules: &RuleSet) -> Verdict {
    if !rules.enabled || rules.is_empty() {
        return Verdict::allow();
    }

    let host = match extract_host(url) {
        Some(host) => normalize_host(host),
        None => return Verdict::allow(),
    };

    if rules.contains(&host) {
        Verdict::block(host)
    } else {
        Verdict::allow()
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Borrowing wrapper for evaluating many URLs against one snapshot.
pub struct Matcher<'a> {
    rules: &'a RuleSet,
}

impl<'a> Matcher<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self { rules }
    }

    pub fn decide(&self, url: &str) -> Verdict {
        decide(url, self.rules)
    }

    pub fn should_block(&self, url: &str) -> bool {
        self.decide(url).block
    }

    pub fn rules(&self) -> &RuleSet {
        self.rules
    }
}
