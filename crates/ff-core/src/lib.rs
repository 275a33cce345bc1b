//! FocusFlow Core Library
//!
//! This crate holds everything the site blocker decides without touching a
//! runtime: the shared rule set, the per-URL decision engine, the message
//! shapes exchanged between the extension's contexts and the web page, and the
//! static blocked page.
//!
//! # Architecture
//!
//! The web application, the extension's background worker, every tab's
//! content scripts and the popup all run in isolated contexts. They agree on a
//! single [`RuleSet`] value by exchanging the messages in [`protocol`]. Each
//! context evaluates pages with [`decide`], which is pure and never fails:
//! anything it cannot evaluate is allowed.
//!
//! # Modules
//!
//! - `types`: `RuleSet`, `Verdict` and payload validation
//! - `url`: Host extraction and domain normalization without a URL parser
//! - `matcher`: The decision engine
//! - `protocol`: Runtime requests, responses, broadcasts and page messages
//! - `config`: Handshake, enforcement and client settings
//! - `blocked_page`: The document shown in place of a blocked site

pub mod blocked_page;
pub mod config;
pub mod matcher;
pub mod protocol;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use config::{ConfigError, FocusConfig};
pub use matcher::{decide, Matcher};
pub use protocol::{Ack, Broadcast, PageMessage, Request, Response};
pub use types::{PayloadError, RuleSet, SchemeMask, Verdict};
pub use url::{extract_host, normalize_domain, normalize_host};
