//! Web application side of the Bridge
//!
//! The page learns whether the extension is installed from the Bridge's
//! announcements, sends requests through the page window, and keeps its own
//! per-user copy of the rule set in a cloud document store. When the
//! extension is absent the page still manages that copy but enforces nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use ff_core::config::HandshakeConfig;
use ff_core::{normalize_domain, PageMessage, Request, Response, RuleSet};

use crate::transport::PageWindow;

pub const NOT_DETECTED_NOTICE: &str =
    "Browser extension not detected. Please install the FocusFlow extension to enable website blocking.";

// =============================================================================
// Presence
// =============================================================================

/// Whether the Bridge has announced itself on this page. Page-local.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionPresence {
    pub installed: bool,
    pub extension_id: Option<String>,
}

/// Records presence on the first announcement the page hears.
pub struct PresenceDetector {
    presence: watch::Receiver<ExtensionPresence>,
    task: JoinHandle<()>,
}

impl PresenceDetector {
    pub fn attach(window: &PageWindow) -> Self {
        let mut inbound = window.subscribe();
        let (tx, presence) = watch::channel(ExtensionPresence::default());

        let task = tokio::spawn(async move {
            loop {
                let raw = match inbound.recv().await {
                    Ok(raw) => raw,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                };
                if let Some(PageMessage::ExtensionReady { extension_id }) = PageMessage::parse(&raw) {
                    info!("Extension detected: {}", extension_id);
                    tx.send_replace(ExtensionPresence {
                        installed: true,
                        extension_id: Some(extension_id),
                    });
                    return;
                }
            }
        });

        Self { presence, task }
    }

    pub fn current(&self) -> ExtensionPresence {
        self.presence.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExtensionPresence> {
        self.presence.clone()
    }

    /// Wait until presence is known, or until the detection window has
    /// passed, and return what the page concluded.
    pub async fn detect(&self, handshake: &HandshakeConfig) -> ExtensionPresence {
        let mut presence = self.presence.clone();
        let found = tokio::time::timeout(handshake.detect_window(), presence.wait_for(|p| p.installed))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if !found {
            debug!("No extension announcement within {:?}", handshake.detect_window());
        }
        self.current()
    }
}

impl Drop for PresenceDetector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Extension Client
// =============================================================================

/// Error type for page-to-extension requests.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Extension is not installed")]
    NotInstalled,
    #[error("No response to message {0}")]
    Timeout(u64),
    #[error("Page window closed")]
    Closed,
    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Sends requests through the Bridge and matches replies by message id.
pub struct ExtensionClient {
    window: PageWindow,
    pending: Pending,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl ExtensionClient {
    pub fn new(window: PageWindow, timeout: Duration) -> Self {
        let mut inbound = window.subscribe();
        let pending: Pending = Arc::default();

        let listener = {
            let pending = pending.clone();
            tokio::spawn(async move {
                loop {
                    let raw = match inbound.recv().await {
                        Ok(raw) => raw,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Client missed {} page messages", missed);
                            continue;
                        }
                        Err(RecvError::Closed) => return,
                    };
                    let Some(PageMessage::ExtensionResponse { message_id, response }) = PageMessage::parse(&raw) else {
                        continue;
                    };
                    let waiter = pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&message_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!("Ignoring response to unknown message {}", message_id),
                    }
                }
            })
        };

        Self {
            window,
            pending,
            timeout,
            listener,
        }
    }

    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let message = serde_json::to_value(request)?;
        let message_id = self.window.next_message_id();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id, tx);

        debug!("Sending {} as message {}", request.kind(), message_id);
        self.window.post(&PageMessage::ToExtension { message, message_id });

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&message_id);
                return Err(ClientError::Timeout(message_id));
            }
        };
        Ok(serde_json::from_value(reply)?)
    }
}

impl Drop for ExtensionClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// =============================================================================
// Cloud Documents
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Document store is offline")]
    Offline,
}

/// The web application's per-user copy of the rule set.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, user: &str) -> Result<Option<RuleSet>, DocumentError>;
    async fn save(&self, user: &str, rules: &RuleSet) -> Result<(), DocumentError>;
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: tokio::sync::Mutex<HashMap<String, RuleSet>>,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DocumentError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DocumentError::Offline);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, user: &str) -> Result<Option<RuleSet>, DocumentError> {
        self.check()?;
        Ok(self.documents.lock().await.get(user).cloned())
    }

    async fn save(&self, user: &str, rules: &RuleSet) -> Result<(), DocumentError> {
        self.check()?;
        self.documents.lock().await.insert(user.to_string(), rules.clone());
        Ok(())
    }
}

// =============================================================================
// Blocklist Manager
// =============================================================================

/// What happened to a change after it was saved to the cloud copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing changed, nothing was sent
    Unchanged,
    /// Saved and accepted by the extension
    Synced,
    /// Saved; no extension to tell
    DisplayOnly,
    /// Saved, but the extension did not accept it
    ExtensionFailed(String),
}

/// The web application's blocklist screen.
pub struct BlocklistManager {
    user: String,
    documents: Arc<dyn DocumentStore>,
    client: ExtensionClient,
    presence: watch::Receiver<ExtensionPresence>,
    view: Arc<watch::Sender<RuleSet>>,
    listener: JoinHandle<()>,
}

impl BlocklistManager {
    /// Load the user's document, creating the default one when missing.
    pub async fn load(
        user: impl Into<String>,
        documents: Arc<dyn DocumentStore>,
        window: &PageWindow,
        presence: watch::Receiver<ExtensionPresence>,
        request_timeout: Duration,
    ) -> Result<Self, DocumentError> {
        let user = user.into();
        let rules = match documents.load(&user).await? {
            Some(rules) => rules,
            None => {
                info!("No blocklist for '{}', creating one", user);
                let rules = RuleSet::default();
                documents.save(&user, &rules).await?;
                rules
            }
        };
        debug!("Loaded blocklist for '{}': {} domains, enabled={}", user, rules.len(), rules.enabled);

        let view = Arc::new(watch::channel(rules).0);
        let listener = tokio::spawn(follow_updates(window.subscribe(), view.clone()));

        Ok(Self {
            user,
            documents,
            client: ExtensionClient::new(window.clone(), request_timeout),
            presence,
            view,
            listener,
        })
    }

    pub fn rules(&self) -> RuleSet {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuleSet> {
        self.view.subscribe()
    }

    pub fn extension_installed(&self) -> bool {
        self.presence.borrow().installed
    }

    /// Notice shown while the page runs display-only.
    pub fn notice(&self) -> Option<&'static str> {
        (!self.extension_installed()).then_some(NOT_DETECTED_NOTICE)
    }

    pub async fn add_domain(&self, input: &str) -> Result<SaveOutcome, DocumentError> {
        let Some(domain) = normalize_domain(input) else {
            return Ok(SaveOutcome::Unchanged);
        };
        let current = self.rules();
        if current.contains(&domain) {
            return Ok(SaveOutcome::Unchanged);
        }
        self.save(current.with_domain(&domain)).await
    }

    pub async fn remove_domain(&self, domain: &str) -> Result<SaveOutcome, DocumentError> {
        let current = self.rules();
        let next = current.without_domain(domain);
        if next == current {
            return Ok(SaveOutcome::Unchanged);
        }
        self.save(next).await
    }

    pub async fn toggle_blocking(&self) -> Result<SaveOutcome, DocumentError> {
        let current = self.rules();
        self.save(current.with_enabled(!current.enabled)).await
    }

    /// Save to the cloud copy first, then push to the extension if present.
    pub async fn save(&self, rules: RuleSet) -> Result<SaveOutcome, DocumentError> {
        self.documents.save(&self.user, &rules).await?;
        self.view.send_replace(rules.clone());
        debug!("Saved blocklist for '{}'", self.user);

        match self.send_to_extension(&Request::update(&rules)).await {
            Ok(response) if response.is_success() => Ok(SaveOutcome::Synced),
            Ok(response) => {
                let reason = match response {
                    Response::Ack(ack) => ack.error.unwrap_or_default(),
                    other => format!("unexpected reply {other:?}"),
                };
                warn!("Extension rejected update: {}", reason);
                Ok(SaveOutcome::ExtensionFailed(reason))
            }
            Err(ClientError::NotInstalled) => {
                info!("Extension not detected, saved to cloud only");
                Ok(SaveOutcome::DisplayOnly)
            }
            Err(e) => {
                warn!("Could not reach extension: {}", e);
                Ok(SaveOutcome::ExtensionFailed(e.to_string()))
            }
        }
    }

    /// Send a request through the Bridge, if one announced itself.
    pub async fn send_to_extension(&self, request: &Request) -> Result<Response, ClientError> {
        if !self.extension_installed() {
            return Err(ClientError::NotInstalled);
        }
        self.client.request(request).await
    }
}

impl Drop for BlocklistManager {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Keep the view in step with changes made elsewhere, such as the popup.
async fn follow_updates(mut inbound: broadcast::Receiver<Value>, view: Arc<watch::Sender<RuleSet>>) {
    loop {
        let raw = match inbound.recv().await {
            Ok(raw) => raw,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        if let Some(PageMessage::DataUpdated { payload }) = PageMessage::parse(&raw) {
            debug!("Extension data updated: {} domains, enabled={}", payload.len(), payload.enabled);
            view.send_if_modified(|current| {
                if *current == payload {
                    return false;
                }
                *current = payload;
                true
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence(installed: bool) -> watch::Receiver<ExtensionPresence> {
        let (tx, rx) = watch::channel(ExtensionPresence {
            installed,
            extension_id: installed.then(|| "ext".to_string()),
        });
        // Keep the value readable after the sender is gone
        drop(tx);
        rx
    }

    /// Stands in for the Bridge: answers every request with `reply`.
    fn fake_bridge(window: &PageWindow, reply: Value) {
        let mut inbound = window.subscribe();
        let window = window.clone();
        tokio::spawn(async move {
            while let Ok(raw) = inbound.recv().await {
                if let Some(PageMessage::ToExtension { message_id, .. }) = PageMessage::parse(&raw) {
                    window.post(&PageMessage::ExtensionResponse {
                        message_id,
                        response: reply.clone(),
                    });
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn detect_without_extension_waits_full_window() {
        let window = PageWindow::new();
        let detector = PresenceDetector::attach(&window);
        let handshake = HandshakeConfig::default();

        let start = tokio::time::Instant::now();
        let presence = detector.detect(&handshake).await;
        assert!(!presence.installed);
        assert_eq!(start.elapsed(), handshake.detect_window());
    }

    #[tokio::test(start_paused = true)]
    async fn detect_resolves_on_announcement() {
        let window = PageWindow::new();
        let detector = PresenceDetector::attach(&window);
        tokio::task::yield_now().await;

        window.post(&PageMessage::ExtensionReady {
            extension_id: "abc".into(),
        });
        let presence = detector.detect(&HandshakeConfig::default()).await;
        assert_eq!(
            presence,
            ExtensionPresence {
                installed: true,
                extension_id: Some("abc".into())
            }
        );
    }

    #[tokio::test]
    async fn client_correlates_concurrent_requests() {
        let window = PageWindow::new();
        let mut inbound = window.subscribe();
        let responder = window.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(raw) = inbound.recv().await {
                if let Some(PageMessage::ToExtension { message_id, .. }) = PageMessage::parse(&raw) {
                    held.push(message_id);
                }
                if held.len() == 2 {
                    // Answer out of order
                    for id in held.drain(..).rev() {
                        responder.post(&PageMessage::ExtensionResponse {
                            message_id: id,
                            response: json!({"success": true, "extensionId": format!("reply-{id}")}),
                        });
                    }
                }
            }
        });

        let client = ExtensionClient::new(window.clone(), Duration::from_secs(5));
        let (a, b) = tokio::join!(client.request(&Request::Ping), client.request(&Request::Ping));
        assert_eq!(a.unwrap(), Response::pong("reply-1"));
        assert_eq!(b.unwrap(), Response::pong("reply-2"));
    }

    #[tokio::test]
    async fn clients_on_one_page_get_their_own_replies() {
        let window = PageWindow::new();
        let mut inbound = window.subscribe();
        let responder = window.clone();
        let rules = RuleSet::new(["a.com"], true);
        let listed = rules.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(raw) = inbound.recv().await {
                if let Some(PageMessage::ToExtension { message, message_id }) = PageMessage::parse(&raw) {
                    let response = match serde_json::from_value::<Request>(message) {
                        Ok(Request::GetBlocklist) => Response::Blocklist(listed.clone()),
                        _ => Response::pong("ext"),
                    };
                    held.push((message_id, response));
                }
                if held.len() == 2 {
                    for (message_id, response) in held.drain(..).rev() {
                        responder.post(&PageMessage::ExtensionResponse {
                            message_id,
                            response: serde_json::to_value(response).unwrap(),
                        });
                    }
                }
            }
        });

        let first = ExtensionClient::new(window.clone(), Duration::from_secs(5));
        let second = ExtensionClient::new(window.clone(), Duration::from_secs(5));
        let (blocklist, pong) = tokio::join!(
            first.request(&Request::GetBlocklist),
            second.request(&Request::Ping)
        );
        assert_eq!(blocklist.unwrap(), Response::Blocklist(rules));
        assert_eq!(pong.unwrap(), Response::pong("ext"));
    }

    #[tokio::test(start_paused = true)]
    async fn client_times_out_without_bridge() {
        let window = PageWindow::new();
        let client = ExtensionClient::new(window, Duration::from_secs(5));
        let err = client.request(&Request::GetBlocklist).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(1)));
    }

    #[tokio::test]
    async fn manager_creates_default_document() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        let manager = BlocklistManager::load("alice", documents.clone(), &window, presence(false), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(manager.rules(), RuleSet::default());
        assert_eq!(documents.load("alice").await.unwrap(), Some(RuleSet::default()));
        assert_eq!(manager.notice(), Some(NOT_DETECTED_NOTICE));
        assert!(matches!(
            manager.send_to_extension(&Request::Ping).await,
            Err(ClientError::NotInstalled)
        ));
    }

    #[tokio::test]
    async fn manager_display_only_without_extension() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        let manager = BlocklistManager::load("bob", documents.clone(), &window, presence(false), Duration::from_secs(1))
            .await
            .unwrap();

        let outcome = manager.add_domain("  YouTube.com ").await.unwrap();
        assert_eq!(outcome, SaveOutcome::DisplayOnly);
        assert_eq!(manager.add_domain("youtube.com").await.unwrap(), SaveOutcome::Unchanged);
        assert_eq!(
            documents.load("bob").await.unwrap(),
            Some(RuleSet::new(["youtube.com"], false))
        );
    }

    #[tokio::test]
    async fn manager_syncs_when_extension_present() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        fake_bridge(&window, json!({"success": true}));
        let manager = BlocklistManager::load("carol", documents, &window, presence(true), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(manager.notice(), None);
        assert_eq!(manager.toggle_blocking().await.unwrap(), SaveOutcome::Synced);
        assert!(manager.rules().enabled);
    }

    #[tokio::test]
    async fn manager_reports_extension_rejection() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        fake_bridge(&window, json!({"success": false, "error": "nope"}));
        let manager = BlocklistManager::load("dan", documents, &window, presence(true), Duration::from_secs(5))
            .await
            .unwrap();

        let outcome = manager.add_domain("reddit.com").await.unwrap();
        assert_eq!(outcome, SaveOutcome::ExtensionFailed("nope".into()));
    }

    #[tokio::test]
    async fn offline_cloud_store_fails_the_save() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        let manager = BlocklistManager::load("erin", documents.clone(), &window, presence(false), Duration::from_secs(1))
            .await
            .unwrap();

        documents.set_offline(true);
        assert_eq!(manager.toggle_blocking().await, Err(DocumentError::Offline));
        assert_eq!(manager.rules(), RuleSet::default());
    }

    #[tokio::test]
    async fn data_updated_refreshes_view() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let window = PageWindow::new();
        let manager = BlocklistManager::load("fay", documents, &window, presence(true), Duration::from_secs(1))
            .await
            .unwrap();
        let mut view = manager.subscribe();

        let rules = RuleSet::new(["x.com"], true);
        window.post(&PageMessage::DataUpdated { payload: rules.clone() });
        view.wait_for(|r| *r == rules).await.unwrap();
        assert_eq!(manager.rules(), rules);
    }
}
