//! Bridge
//!
//! Content script injected into the web application's pages. It announces the
//! extension to the page, relays page requests into the runtime, and forwards
//! coordinator broadcasts back onto the page window.
//!
//! The announcement is repeated because the page's listener may attach after
//! the Bridge starts, and a window message sent before that is simply lost.

use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use ff_core::config::HandshakeConfig;
use ff_core::{Broadcast, PageMessage, Request, Response};

use crate::transport::{Origin, PageWindow, Runtime, TabId};

pub struct Bridge {
    tab: TabId,
    extension_id: String,
    runtime: Runtime,
    window: PageWindow,
    handshake: HandshakeConfig,
}

impl Bridge {
    pub fn new(
        tab: TabId,
        extension_id: impl Into<String>,
        runtime: Runtime,
        window: PageWindow,
        handshake: HandshakeConfig,
    ) -> Self {
        Self {
            tab,
            extension_id: extension_id.into(),
            runtime,
            window,
            handshake,
        }
    }

    /// Start announcing, relaying and forwarding. The window is subscribed
    /// before this returns, so no page request posted afterwards is missed.
    pub fn spawn(self, updates: mpsc::UnboundedReceiver<Broadcast>) -> BridgeHandle {
        let inbound = self.window.subscribe();
        let (announced_tx, announced) = watch::channel(0);

        let announcer = tokio::spawn(announce(
            self.window.clone(),
            self.extension_id.clone(),
            self.handshake.clone(),
            announced_tx,
        ));
        let forwarder = tokio::spawn(forward_updates(self.tab, self.window.clone(), updates));
        let relay = tokio::spawn(self.relay(inbound));

        BridgeHandle {
            tasks: vec![announcer, forwarder, relay],
            announced,
        }
    }

    async fn relay(self, mut inbound: broadcast::Receiver<Value>) {
        loop {
            let raw = match inbound.recv().await {
                Ok(raw) => raw,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Tab {}: bridge missed {} page messages", self.tab, missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            // Our own posts and foreign scripts share the window
            let Some(PageMessage::ToExtension { message, message_id }) = PageMessage::parse(&raw) else {
                continue;
            };

            let tab = self.tab;
            let runtime = self.runtime.clone();
            let window = self.window.clone();
            tokio::spawn(async move {
                let response = forward(tab, &runtime, message).await;
                match serde_json::to_value(&response) {
                    Ok(response) => window.post(&PageMessage::ExtensionResponse { message_id, response }),
                    Err(e) => warn!("Tab {}: could not encode response {}: {}", tab, message_id, e),
                }
            });
        }
    }
}

/// Pass one page request into the runtime. Every failure becomes an
/// unsuccessful response so the page always hears back.
async fn forward(tab: TabId, runtime: &Runtime, message: Value) -> Response {
    let request: Request = match serde_json::from_value(message) {
        Ok(request) => request,
        Err(e) => {
            debug!("Tab {}: unrecognized page request: {}", tab, e);
            return Response::failure(format!("Unrecognized request: {e}"));
        }
    };

    debug!("Tab {}: relaying {}", tab, request.kind());
    match runtime.send_message(Origin::Tab(tab), request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Tab {}: relay failed: {}", tab, e);
            Response::failure(e.to_string())
        }
    }
}

async fn announce(
    window: PageWindow,
    extension_id: String,
    handshake: HandshakeConfig,
    announced: watch::Sender<u32>,
) {
    let mut ticker = tokio::time::interval(handshake.interval().max(Duration::from_millis(1)));
    for n in 1..=handshake.announcements {
        // First tick completes immediately
        ticker.tick().await;
        window.post(&PageMessage::ExtensionReady {
            extension_id: extension_id.clone(),
        });
        announced.send_replace(n);
    }
    debug!("Sent {} presence announcements", handshake.announcements);
}

async fn forward_updates(tab: TabId, window: PageWindow, mut updates: mpsc::UnboundedReceiver<Broadcast>) {
    while let Some(update) = updates.recv().await {
        debug!("Tab {}: forwarding rules to page", tab);
        window.post(&PageMessage::DataUpdated {
            payload: update.rules().clone(),
        });
    }
}

pub struct BridgeHandle {
    tasks: Vec<JoinHandle<()>>,
    announced: watch::Receiver<u32>,
}

impl BridgeHandle {
    /// Announcements sent so far.
    pub fn announced(&self) -> u32 {
        *self.announced.borrow()
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::RuleSet;
    use serde_json::json;

    fn bridge(runtime: &Runtime, window: &PageWindow) -> Bridge {
        Bridge::new(3, "ext-id", runtime.clone(), window.clone(), HandshakeConfig::default())
    }

    async fn next_message(rx: &mut broadcast::Receiver<Value>) -> PageMessage {
        loop {
            let raw = rx.recv().await.unwrap();
            if let Some(message) = PageMessage::parse(&raw) {
                return message;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announces_bounded_number_of_times() {
        let runtime = Runtime::new();
        let window = PageWindow::new();
        let mut page = window.subscribe();
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = bridge(&runtime, &window).spawn(rx);

        let start = tokio::time::Instant::now();
        for _ in 0..10 {
            let message = next_message(&mut page).await;
            assert_eq!(
                message,
                PageMessage::ExtensionReady {
                    extension_id: "ext-id".into()
                }
            );
        }
        assert_eq!(start.elapsed(), Duration::from_millis(4500));
        assert_eq!(handle.announced(), 10);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(page.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_listener_still_hears_announcement() {
        let runtime = Runtime::new();
        let window = PageWindow::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let _handle = bridge(&runtime, &window).spawn(rx);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let mut page = window.subscribe();
        let message = next_message(&mut page).await;
        assert!(matches!(message, PageMessage::ExtensionReady { .. }));
    }

    #[tokio::test]
    async fn relays_requests_and_correlates_ids() {
        let runtime = Runtime::new();
        let mut inbox = runtime.attach();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                assert_eq!(envelope.origin, Origin::Tab(3));
                let _ = envelope.reply.send(Response::pong("ext-id"));
            }
        });

        let window = PageWindow::new();
        let mut page = window.subscribe();
        let (_tx, rx) = mpsc::unbounded_channel();
        let _handle = bridge(&runtime, &window).spawn(rx);

        window.post(&PageMessage::ToExtension {
            message: json!({"type": "PING"}),
            message_id: 41,
        });

        loop {
            if let PageMessage::ExtensionResponse { message_id, response } = next_message(&mut page).await {
                assert_eq!(message_id, 41);
                assert_eq!(response, json!({"success": true, "extensionId": "ext-id"}));
                break;
            }
        }
    }

    #[tokio::test]
    async fn unknown_requests_and_dead_runtime_answer_failure() {
        let runtime = Runtime::new();
        let window = PageWindow::new();
        let mut page = window.subscribe();
        let (_tx, rx) = mpsc::unbounded_channel();
        let _handle = bridge(&runtime, &window).spawn(rx);

        window.post(&PageMessage::ToExtension {
            message: json!({"type": "SELF_DESTRUCT"}),
            message_id: 1,
        });
        window.post(&PageMessage::ToExtension {
            message: json!({"type": "PING"}),
            message_id: 2,
        });

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let PageMessage::ExtensionResponse { message_id, response } = next_message(&mut page).await {
                let response: Response = serde_json::from_value(response).unwrap();
                assert!(!response.is_success());
                seen.push(message_id);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn forwards_broadcasts_as_data_updated() {
        let runtime = Runtime::new();
        let window = PageWindow::new();
        let mut page = window.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = bridge(&runtime, &window).spawn(rx);

        let rules = RuleSet::new(["a.com"], true);
        tx.send(Broadcast::UpdateBlocklist { payload: rules.clone() }).unwrap();

        loop {
            if let PageMessage::DataUpdated { payload } = next_message(&mut page).await {
                assert_eq!(payload, rules);
                break;
            }
        }
    }
}
