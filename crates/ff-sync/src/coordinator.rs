//! Background Coordinator
//!
//! The single long-lived context per browser. It owns the in-memory copy of
//! the rule set, answers runtime requests from it, and broadcasts every
//! committed change to all tabs.
//!
//! The platform may tear the worker down between any two events, so nothing
//! here survives a restart: [`Coordinator::spawn`] rehydrates the cache from
//! the store and re-broadcasts it before serving its first request.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use ff_core::{decide, Broadcast, Request, Response, RuleSet};

use crate::store::{RuleStore, StoreChange};
use crate::transport::{Envelope, Runtime, TabDirectory};

/// Outcome of one broadcast. Unreachable tabs are skipped, never fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
}

/// What the coordinator currently holds, published for observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorState {
    pub rules: RuleSet,
    pub broadcasts: u64,
    pub last_report: BroadcastReport,
}

pub struct Coordinator {
    store: Arc<dyn RuleStore>,
    tabs: TabDirectory,
    extension_id: String,
    cache: RuleSet,
    state: watch::Sender<CoordinatorState>,
}

impl Coordinator {
    /// Start the coordinator. The runtime is attached before this returns, so
    /// requests sent right away queue up and are answered after rehydration.
    pub fn spawn(
        store: Arc<dyn RuleStore>,
        tabs: TabDirectory,
        runtime: Runtime,
        extension_id: impl Into<String>,
    ) -> CoordinatorHandle {
        let inbox = runtime.attach();
        let changes = store.subscribe();
        let (state, state_rx) = watch::channel(CoordinatorState::default());
        let extension_id = extension_id.into();

        let task = tokio::spawn(async move {
            let cache = store.get().await;
            info!(
                "Coordinator started with {} domains, enabled={}",
                cache.len(),
                cache.enabled
            );
            let coordinator = Coordinator {
                store,
                tabs,
                extension_id,
                cache,
                state,
            };
            coordinator.resync();
            coordinator.run(inbox, changes).await;
        });

        CoordinatorHandle {
            task,
            runtime,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut changes: broadcast::Receiver<StoreChange>,
    ) {
        loop {
            tokio::select! {
                biased;
                change = changes.recv() => match change {
                    Ok(change) => self.on_store_change(change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} store changes, re-reading rules", missed);
                        self.cache = self.store.get().await;
                        let report = self.broadcast();
                        self.publish(Some(report));
                    }
                    Err(RecvError::Closed) => {
                        warn!("Rule store closed, coordinator stopping");
                        break;
                    }
                },
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.on_message(envelope).await,
                    None => {
                        debug!("Runtime detached, coordinator stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn on_message(&mut self, envelope: Envelope) {
        let Envelope { request, origin, reply } = envelope;
        debug!("Received {} from {}", request.kind(), origin);

        let response = match request {
            Request::Ping => Response::pong(&self.extension_id),
            Request::GetBlocklist => Response::Blocklist(self.cache.clone()),
            Request::CheckNavigation { url } => Response::Verdict(decide(&url, &self.cache)),
            Request::UpdateBlocklist { payload } => {
                let rules = match RuleSet::from_payload(&payload) {
                    Ok(rules) => rules,
                    Err(e) => {
                        warn!("Rejected UPDATE_BLOCKLIST from {}: {}", origin, e);
                        let _ = reply.send(Response::failure(e.to_string()));
                        return;
                    }
                };

                if let Err(e) = self.store.set(rules.clone()).await {
                    warn!("Failed to persist rules from {}: {}", origin, e);
                    let _ = reply.send(Response::failure(e.to_string()));
                    return;
                }

                info!(
                    "Blocklist updated by {}: {} domains, enabled={}",
                    origin,
                    rules.len(),
                    rules.enabled
                );
                self.cache = rules;

                // Reply first; the broadcast is fire-and-forget
                if reply.send(Response::ok()).is_err() {
                    debug!("{} stopped waiting for its reply", origin);
                }
                let report = self.broadcast();
                self.publish(Some(report));
                return;
            }
        };

        if reply.send(response).is_err() {
            debug!("{} stopped waiting for its reply", origin);
        }
    }

    /// Push the rehydrated rules to every open tab. Writes made while no
    /// coordinator was running, or between subscribing and the first read,
    /// only reach tabs this way. The default blocks nothing, so it is only
    /// published.
    fn resync(&self) {
        if self.cache == RuleSet::default() {
            self.publish(None);
            return;
        }
        let report = self.broadcast();
        self.publish(Some(report));
    }

    fn on_store_change(&mut self, change: StoreChange) {
        if change.new == self.cache {
            // Our own write, already broadcast
            return;
        }
        debug!(
            "Store changed elsewhere: enabled {} -> {}, {} -> {} domains",
            change.old.enabled,
            change.new.enabled,
            change.old.len(),
            change.new.len()
        );
        self.cache = change.new;
        let report = self.broadcast();
        self.publish(Some(report));
    }

    /// Send the cached rules to every tab. Tabs that cannot be reached are
    /// logged and skipped.
    fn broadcast(&self) -> BroadcastReport {
        let message = Broadcast::UpdateBlocklist {
            payload: self.cache.clone(),
        };
        let mut report = BroadcastReport::default();
        for tab in self.tabs.ids() {
            match self.tabs.send(tab, &message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!("Could not message tab {}: {}", tab, e);
                    report.skipped += 1;
                }
            }
        }
        debug!(
            "Broadcast UPDATE_BLOCKLIST to {} tabs ({} skipped)",
            report.delivered, report.skipped
        );
        report
    }

    fn publish(&self, report: Option<BroadcastReport>) {
        let rules = self.cache.clone();
        self.state.send_modify(|state| {
            state.rules = rules;
            if let Some(report) = report {
                state.broadcasts += 1;
                state.last_report = report;
            }
        });
    }
}

/// Owner's handle on a running coordinator.
pub struct CoordinatorHandle {
    task: JoinHandle<()>,
    runtime: Runtime,
    state: watch::Receiver<CoordinatorState>,
}

impl CoordinatorHandle {
    /// The coordinator's cached rule set.
    pub fn rules(&self) -> RuleSet {
        self.state.borrow().rules.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Tear the coordinator down, as the platform does when it suspends the
    /// worker. In-flight requests see their reply dropped.
    pub fn shutdown(self) {
        self.runtime.detach();
        self.task.abort();
    }
}
