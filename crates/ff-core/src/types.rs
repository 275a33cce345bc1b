//! Core type definitions for FocusFlow
//!
//! The rule set is the only state shared between the web application, the
//! extension's background worker, the popup and every open tab.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::url::normalize_domain;

// =============================================================================
// Scheme Masks
// =============================================================================

bitflags::bitflags! {
    /// URL scheme mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SchemeMask: u8 {
        const HTTP = 1 << 0;
        const HTTPS = 1 << 1;
        /// Schemes the decision engine evaluates
        const WEB = Self::HTTP.bits() | Self::HTTPS.bits();
    }
}

// =============================================================================
// Rule Set
// =============================================================================

/// The blocklist: a set of normalized hostnames and a master switch.
///
/// `RuleSet::default()` is the fail-open value (`{domains: [], enabled: false}`)
/// used wherever a read cannot complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct RuleSet {
    /// Normalized hostnames (lowercase, no leading `www.`, no scheme or path)
    pub domains: BTreeSet<String>,
    /// When false nothing is blocked, whatever `domains` holds
    pub enabled: bool,
}

impl RuleSet {
    /// Build a rule set, normalizing and deduplicating every entry.
    /// Entries that normalize to nothing are dropped.
    pub fn new<I, S>(domains: I, enabled: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        Self { domains, enabled }
    }

    /// Validate an untrusted `UPDATE_BLOCKLIST` payload.
    ///
    /// The whole payload is rejected on the first shape violation so that a
    /// malformed update is never partially applied. The legacy `isActive`
    /// key is accepted in place of `enabled`.
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        let object = payload.as_object().ok_or(PayloadError::NotAnObject)?;

        let domains = object
            .get("domains")
            .and_then(Value::as_array)
            .ok_or(PayloadError::DomainsNotArray)?;

        let mut names = Vec::with_capacity(domains.len());
        for (idx, entry) in domains.iter().enumerate() {
            let name = entry.as_str().ok_or(PayloadError::DomainNotString(idx))?;
            names.push(name);
        }

        let enabled = object
            .get("enabled")
            .or_else(|| object.get("isActive"))
            .and_then(Value::as_bool)
            .ok_or(PayloadError::EnabledNotBool)?;

        Ok(Self::new(names, enabled))
    }

    /// Check whether an already-normalized host is listed.
    #[inline]
    pub fn contains(&self, host: &str) -> bool {
        self.domains.contains(host)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Copy of this rule set with one more domain. Invalid input leaves it unchanged.
    pub fn with_domain(&self, domain: &str) -> Self {
        let mut next = self.clone();
        if let Some(domain) = normalize_domain(domain) {
            next.domains.insert(domain);
        }
        next
    }

    /// Copy of this rule set without the given domain.
    pub fn without_domain(&self, domain: &str) -> Self {
        let mut next = self.clone();
        if let Some(domain) = normalize_domain(domain) {
            next.domains.remove(&domain);
        }
        next
    }

    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            domains: self.domains.clone(),
            enabled,
        }
    }
}

/// Lenient storage shape: missing keys default, as the extension platform
/// returns nothing for keys that were never written.
#[derive(Deserialize)]
struct StoredRuleSet {
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default, alias = "isActive")]
    enabled: bool,
}

impl<'de> Deserialize<'de> for RuleSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = StoredRuleSet::deserialize(deserializer)?;
        Ok(Self::new(stored.domains, stored.enabled))
    }
}

/// Error type for `UPDATE_BLOCKLIST` payload validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload is not an object")]
    NotAnObject,
    #[error("`domains` must be an array of strings")]
    DomainsNotArray,
    #[error("`domains[{0}]` is not a string")]
    DomainNotString(usize),
    #[error("`enabled` must be a boolean")]
    EnabledNotBool,
}

// =============================================================================
// Verdict
// =============================================================================

/// Result of evaluating one URL against a rule set.
/// Derived per page view, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Verdict {
    pub block: bool,
    #[serde(rename = "matchedDomain", default)]
    pub matched_domain: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(domain: impl Into<String>) -> Self {
        Self {
            block: true,
            matched_domain: Some(domain.into()),
        }
    }
}
