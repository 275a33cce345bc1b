//! Message passing between isolated contexts
//!
//! Three channels model what the browser platform provides:
//!
//! - [`Runtime`]: request/response messaging into the background context.
//!   Survives the background worker being torn down; requests sent while no
//!   worker is attached fail with [`TransportError::NoReceiver`].
//! - [`TabDirectory`]: delivery from the background context to the content
//!   scripts of one tab. FIFO within a tab; privileged pages are unreachable.
//! - [`PageWindow`]: a page's `postMessage` channel. Only listeners attached
//!   at send time see a message.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::warn;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use ff_core::url::extract_scheme;
use ff_core::{Broadcast, PageMessage, Request, Response};

pub type TabId = u32;

const WINDOW_CAPACITY: usize = 256;

/// Error type for cross-context delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No background context is listening")]
    NoReceiver,
    #[error("Reply channel closed before a response arrived")]
    ReplyDropped,
    #[error("Tab {0} does not exist")]
    NoSuchTab(TabId),
    #[error("Tab {0} is not reachable")]
    Unreachable(TabId),
    #[error("Tab {0} has no listener")]
    NoListener(TabId),
}

/// Which context sent a runtime request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Tab(TabId),
    Popup,
    Extension,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tab(id) => write!(f, "tab {id}"),
            Self::Popup => f.write_str("popup"),
            Self::Extension => f.write_str("extension"),
        }
    }
}

// =============================================================================
// Runtime Messaging
// =============================================================================

/// A request in flight to the background context.
#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub origin: Origin,
    pub reply: oneshot::Sender<Response>,
}

#[derive(Clone, Default)]
pub struct Runtime {
    inbox: Arc<RwLock<Option<mpsc::UnboundedSender<Envelope>>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a background context. Replaces any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbox.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Detach the background context, as when the platform suspends it.
    pub fn detach(&self) {
        *self.inbox.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Send a request and wait for the reply.
    pub async fn send_message(&self, origin: Origin, request: Request) -> Result<Response, TransportError> {
        let sender = self
            .inbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NoReceiver)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Envelope { request, origin, reply })
            .map_err(|_| TransportError::NoReceiver)?;

        response.await.map_err(|_| TransportError::ReplyDropped)
    }
}

// =============================================================================
// Tabs
// =============================================================================

struct TabEntry {
    url: String,
    listeners: Vec<mpsc::UnboundedSender<Broadcast>>,
}

#[derive(Default)]
struct TabTable {
    next_id: TabId,
    tabs: BTreeMap<TabId, TabEntry>,
}

/// Every open tab and the content-script listeners injected into it.
#[derive(Clone, Default)]
pub struct TabDirectory {
    inner: Arc<RwLock<TabTable>>,
}

impl TabDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, url: &str) -> TabId {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        table.next_id += 1;
        let id = table.next_id;
        table.tabs.insert(
            id,
            TabEntry {
                url: url.to_string(),
                listeners: Vec::new(),
            },
        );
        id
    }

    pub fn close(&self, tab: TabId) {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        table.tabs.remove(&tab);
    }

    /// Navigate a tab: the old document's listeners are torn down.
    pub fn navigate(&self, tab: TabId, url: &str) -> Result<(), TransportError> {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table.tabs.get_mut(&tab).ok_or(TransportError::NoSuchTab(tab))?;
        entry.url = url.to_string();
        entry.listeners.clear();
        Ok(())
    }

    pub fn url(&self, tab: TabId) -> Option<String> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table.tabs.get(&tab).map(|entry| entry.url.clone())
    }

    /// Whether content scripts run in this tab. Privileged and internal pages
    /// (`chrome://`, `about:`) never get them.
    pub fn is_reachable(&self, tab: TabId) -> bool {
        self.url(tab).is_some_and(|url| extract_scheme(&url).is_some())
    }

    pub fn ids(&self) -> Vec<TabId> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        table.tabs.keys().copied().collect()
    }

    /// Register a content-script listener in a tab.
    pub fn listen(&self, tab: TabId) -> Result<mpsc::UnboundedReceiver<Broadcast>, TransportError> {
        if !self.is_reachable(tab) {
            return Err(TransportError::Unreachable(tab));
        }
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table.tabs.get_mut(&tab).ok_or(TransportError::NoSuchTab(tab))?;
        let (tx, rx) = mpsc::unbounded_channel();
        entry.listeners.push(tx);
        Ok(rx)
    }

    /// Deliver a broadcast to every listener in one tab.
    pub fn send(&self, tab: TabId, message: &Broadcast) -> Result<(), TransportError> {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table.tabs.get_mut(&tab).ok_or(TransportError::NoSuchTab(tab))?;
        if extract_scheme(&entry.url).is_none() {
            return Err(TransportError::Unreachable(tab));
        }
        entry.listeners.retain(|listener| listener.send(message.clone()).is_ok());
        if entry.listeners.is_empty() {
            return Err(TransportError::NoListener(tab));
        }
        Ok(())
    }
}

// =============================================================================
// Page Window
// =============================================================================

/// A page's `window.postMessage` channel, shared by the web application and
/// the Bridge running in the same tab.
#[derive(Clone)]
pub struct PageWindow {
    tx: broadcast::Sender<Value>,
    next_message_id: Arc<AtomicU64>,
}

impl PageWindow {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WINDOW_CAPACITY);
        Self {
            tx,
            next_message_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Message ids are unique per page, so every client on the page can
    /// tell its own replies apart from the others'.
    pub fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn post(&self, message: &PageMessage) {
        match serde_json::to_value(message) {
            Ok(value) => self.post_raw(value),
            Err(e) => warn!("Dropping unencodable page message: {}", e),
        }
    }

    /// Post arbitrary data. Nobody listening is not an error.
    pub fn post_raw(&self, value: Value) {
        let _ = self.tx.send(value);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl Default for PageWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::RuleSet;

    #[tokio::test]
    async fn runtime_without_receiver_fails() {
        let runtime = Runtime::new();
        let result = runtime.send_message(Origin::Popup, Request::Ping).await;
        assert_eq!(result, Err(TransportError::NoReceiver));
    }

    #[tokio::test]
    async fn runtime_round_trip() {
        let runtime = Runtime::new();
        let mut inbox = runtime.attach();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let _ = envelope.reply.send(Response::pong("test"));
            }
        });

        let response = runtime.send_message(Origin::Tab(1), Request::Ping).await.unwrap();
        assert_eq!(response, Response::pong("test"));

        runtime.detach();
        assert!(!runtime.is_attached());
    }

    #[tokio::test]
    async fn dropped_reply_is_reported() {
        let runtime = Runtime::new();
        let mut inbox = runtime.attach();
        tokio::spawn(async move {
            // Swallow without replying
            while let Some(envelope) = inbox.recv().await {
                drop(envelope);
            }
        });
        let result = runtime.send_message(Origin::Popup, Request::GetBlocklist).await;
        assert_eq!(result, Err(TransportError::ReplyDropped));
    }

    #[test]
    fn tab_delivery_rules() {
        let tabs = TabDirectory::new();
        let web = tabs.open("https://example.com");
        let internal = tabs.open("chrome://extensions");
        let message = Broadcast::UpdateBlocklist {
            payload: RuleSet::default(),
        };

        assert_eq!(tabs.send(web, &message), Err(TransportError::NoListener(web)));
        assert_eq!(tabs.send(internal, &message), Err(TransportError::Unreachable(internal)));
        assert!(tabs.listen(internal).is_err());
        assert_eq!(tabs.send(99, &message), Err(TransportError::NoSuchTab(99)));

        let mut rx = tabs.listen(web).unwrap();
        tabs.send(web, &message).unwrap();
        assert_eq!(rx.try_recv().unwrap(), message);

        tabs.navigate(web, "https://other.com").unwrap();
        assert_eq!(tabs.send(web, &message), Err(TransportError::NoListener(web)));
        assert_eq!(tabs.ids(), vec![web, internal]);
    }

    #[test]
    fn tab_delivery_is_fifo() {
        let tabs = TabDirectory::new();
        let tab = tabs.open("https://example.com");
        let mut rx = tabs.listen(tab).unwrap();

        for enabled in [true, false, true] {
            let message = Broadcast::UpdateBlocklist {
                payload: RuleSet::default().with_enabled(enabled),
            };
            tabs.send(tab, &message).unwrap();
        }

        let order: Vec<bool> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.rules().enabled)
            .collect();
        assert_eq!(order, vec![true, false, true]);
    }

    #[tokio::test]
    async fn window_only_reaches_attached_listeners() {
        let window = PageWindow::new();
        window.post(&PageMessage::ExtensionReady {
            extension_id: "early".into(),
        });

        let mut late = window.subscribe();
        window.post(&PageMessage::ExtensionReady {
            extension_id: "late".into(),
        });

        let seen = PageMessage::parse(&late.recv().await.unwrap());
        assert_eq!(
            seen,
            Some(PageMessage::ExtensionReady {
                extension_id: "late".into()
            })
        );
        assert!(late.try_recv().is_err());
    }
}
