//! FocusFlow Cross-Context Synchronization
//!
//! This crate runs the blocklist across every context the extension spans:
//! the background coordinator, one enforcement point and one Bridge per tab,
//! the popup, and the web application on the other side of the Bridge.
//!
//! Contexts share no memory. Each one is a tokio task that talks to the
//! others through the channels in [`transport`], and the [`store`] is the only
//! durable source of truth. Delivery is best effort, FIFO within a tab and
//! unordered across tabs; the rule set converges by last write wins.
//!
//! # Modules
//!
//! - `store`: The persistent rule store and its change notifications
//! - `transport`: Runtime messaging, tab delivery and page windows
//! - `coordinator`: The background worker that caches and broadcasts rules
//! - `enforcement`: Per-tab state machine and the two enforcement strategies
//! - `bridge`: Page-to-extension relay and presence handshake
//! - `webapp`: The web application's side of the Bridge
//! - `popup`: The control surface over the rule store
//! - `browser`: Wires all contexts together into one simulated browser

pub mod bridge;
pub mod browser;
pub mod coordinator;
pub mod enforcement;
pub mod popup;
pub mod store;
pub mod transport;
pub mod webapp;

pub use bridge::Bridge;
pub use browser::Browser;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use enforcement::{EnforcementPoint, PageState};
pub use popup::{Popup, PopupView};
pub use store::{FileRuleStore, MemoryRuleStore, RuleStore, StoreChange};
pub use transport::{Origin, PageWindow, Runtime, TabDirectory, TabId};
pub use webapp::{BlocklistManager, ExtensionClient, ExtensionPresence};
