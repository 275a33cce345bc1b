//! Wire protocol between the web page, the Bridge, the background
//! coordinator and the enforcement points.
//!
//! Runtime requests and broadcasts are tagged by a `type` field. Page messages
//! keep the type names the deployed web application already listens for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RuleSet, Verdict};

// =============================================================================
// Runtime Messages
// =============================================================================

/// Request sent into the extension's messaging system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Request {
    /// Liveness and identity probe
    Ping,
    /// Current cached rule set
    GetBlocklist,
    /// Replace the rule set. The payload is validated by the coordinator.
    UpdateBlocklist { payload: Value },
    /// Evaluate a main-frame navigation before it is fetched
    CheckNavigation { url: String },
}

impl Request {
    /// Name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::GetBlocklist => "GET_BLOCKLIST",
            Self::UpdateBlocklist { .. } => "UPDATE_BLOCKLIST",
            Self::CheckNavigation { .. } => "CHECK_NAVIGATION",
        }
    }

    pub fn update(rules: &RuleSet) -> Self {
        Self::UpdateBlocklist {
            payload: serde_json::json!({
                "domains": rules.domains,
                "enabled": rules.enabled,
            }),
        }
    }
}

/// Acknowledgement for `PING` and `UPDATE_BLOCKLIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Ack {
    pub success: bool,
    #[serde(rename = "extensionId", default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to a [`Request`].
///
/// Untagged on the wire; variants are tried in order, so the shapes with
/// required fields come first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Response {
    Ack(Ack),
    Verdict(Verdict),
    Blocklist(RuleSet),
}

impl Response {
    pub fn ok() -> Self {
        Self::Ack(Ack {
            success: true,
            extension_id: None,
            error: None,
        })
    }

    pub fn pong(extension_id: impl Into<String>) -> Self {
        Self::Ack(Ack {
            success: true,
            extension_id: Some(extension_id.into()),
            error: None,
        })
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Ack(Ack {
            success: false,
            extension_id: None,
            error: Some(reason.into()),
        })
    }

    /// Whether this response reports success. Data replies count as success.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Ack(ack) => ack.success,
            Self::Verdict(_) | Self::Blocklist(_) => true,
        }
    }

    pub fn into_rules(self) -> Option<RuleSet> {
        match self {
            Self::Blocklist(rules) => Some(rules),
            _ => None,
        }
    }
}

/// Coordinator to enforcement point and popup. No reply is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Broadcast {
    UpdateBlocklist { payload: RuleSet },
}

impl Broadcast {
    pub fn rules(&self) -> &RuleSet {
        match self {
            Self::UpdateBlocklist { payload } => payload,
        }
    }
}

// =============================================================================
// Page Messages
// =============================================================================

/// Messages posted on the page's window between the web application and the
/// Bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum PageMessage {
    /// Bridge announces the extension is present
    #[serde(rename = "FOCUSFLOW_EXTENSION_READY")]
    ExtensionReady {
        #[serde(rename = "extensionId")]
        extension_id: String,
    },
    /// Page asks the Bridge to forward `message` into the extension
    #[serde(rename = "FOCUSFLOW_TO_EXTENSION")]
    ToExtension {
        message: Value,
        #[serde(rename = "messageId")]
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        message_id: u64,
    },
    /// Bridge relays the extension's reply
    #[serde(rename = "EXTENSION_RESPONSE")]
    ExtensionResponse {
        #[serde(rename = "messageId")]
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        message_id: u64,
        response: Value,
    },
    /// Bridge forwards a coordinator broadcast
    #[serde(rename = "EXTENSION_DATA_UPDATED")]
    DataUpdated { payload: RuleSet },
}

impl PageMessage {
    /// Parse a raw window message. Anything that is not part of this
    /// protocol (other scripts post on the same window) yields None.
    pub fn parse(raw: &Value) -> Option<Self> {
        serde_json::from_value(raw.clone()).ok()
    }
}
