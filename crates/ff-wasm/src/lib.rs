//! WebAssembly bindings for the FocusFlow site blocker
//!
//! The extension's JavaScript shell keeps the rule set here and asks for
//! verdicts; storage and messaging stay on the JS side.

use std::sync::{PoisonError, RwLock};

use wasm_bindgen::prelude::*;

use ff_core::config::HandshakeConfig;
use ff_core::{blocked_page, RuleSet, Verdict};

static RULES: RwLock<Option<RuleSet>> = RwLock::new(None);

fn current_rules() -> RuleSet {
    RULES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default()
}

fn parse_rules(rules_json: &str) -> Result<RuleSet, String> {
    let value: serde_json::Value =
        serde_json::from_str(rules_json).map_err(|e| format!("Invalid JSON: {}", e))?;
    RuleSet::from_payload(&value).map_err(|e| e.to_string())
}

fn verdict_to_js(verdict: &Verdict) -> JsValue {
    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"block".into(), &JsValue::from(verdict.block));
    let matched = match &verdict.matched_domain {
        Some(domain) => JsValue::from_str(domain),
        None => JsValue::NULL,
    };
    let _ = js_sys::Reflect::set(&result, &"matchedDomain".into(), &matched);
    result.into()
}

/// Replace the cached rule set. Rejects malformed input and keeps the
/// previous rules.
#[wasm_bindgen]
pub fn set_rules(rules_json: &str) -> Result<(), JsValue> {
    let rules = parse_rules(rules_json).map_err(|e| {
        web_sys::console::warn_1(&format!("[FocusFlow] Rejected rules: {}", e).into());
        JsValue::from_str(&e)
    })?;
    *RULES.write().unwrap_or_else(PoisonError::into_inner) = Some(rules);
    Ok(())
}

/// Current rule set as JSON. Before `set_rules` this is the fail-open default.
#[wasm_bindgen]
pub fn get_rules() -> Result<String, JsValue> {
    serde_json::to_string(&current_rules()).map_err(|e| JsValue::from_str(&e.to_string()))
}

#[wasm_bindgen]
pub fn is_initialized() -> bool {
    RULES.read().unwrap_or_else(PoisonError::into_inner).is_some()
}

#[wasm_bindgen]
pub fn should_block(url: &str) -> bool {
    ff_core::decide(url, &current_rules()).block
}

/// `{block, matchedDomain}` for a URL against the cached rules.
#[wasm_bindgen]
pub fn decide(url: &str) -> JsValue {
    verdict_to_js(&ff_core::decide(url, &current_rules()))
}

/// Decide against an explicit rule set without touching the cache.
#[wasm_bindgen]
pub fn decide_with(url: &str, rules_json: &str) -> Result<JsValue, JsValue> {
    let rules = parse_rules(rules_json).map_err(|e| JsValue::from_str(&e))?;
    Ok(verdict_to_js(&ff_core::decide(url, &rules)))
}

#[wasm_bindgen]
pub fn normalize_domain(input: &str) -> Option<String> {
    ff_core::normalize_domain(input)
}

/// Check an `UPDATE_BLOCKLIST` payload: `{valid, error?, rules?}`.
#[wasm_bindgen]
pub fn validate_update(payload_json: &str) -> JsValue {
    let result = js_sys::Object::new();
    match parse_rules(payload_json) {
        Ok(rules) => {
            let _ = js_sys::Reflect::set(&result, &"valid".into(), &JsValue::TRUE);
            if let Ok(json) = serde_json::to_string(&rules) {
                let _ = js_sys::Reflect::set(&result, &"rules".into(), &JsValue::from_str(&json));
            }
        }
        Err(e) => {
            let _ = js_sys::Reflect::set(&result, &"valid".into(), &JsValue::FALSE);
            let _ = js_sys::Reflect::set(&result, &"error".into(), &JsValue::from_str(&e));
        }
    }
    result.into()
}

#[wasm_bindgen]
pub fn render_blocked_page(domain: &str) -> String {
    blocked_page::render(domain)
}

/// Millisecond offsets at which the Bridge announces itself, for the
/// configured `handshake.interval_ms` and `handshake.announcements`.
/// Offsets past `u32::MAX` saturate.
#[wasm_bindgen]
pub fn handshake_schedule(interval_ms: u32, announcements: u32) -> Vec<u32> {
    let handshake = HandshakeConfig {
        interval_ms: u64::from(interval_ms),
        announcements,
        ..HandshakeConfig::default()
    };
    handshake
        .schedule()
        .map(|offset| u32::try_from(offset.as_millis()).unwrap_or(u32::MAX))
        .collect()
}
