//! Popup
//!
//! The extension's control surface. It runs in the same privileged context as
//! the coordinator, so it reads and writes the rule store directly and
//! re-renders on every store change, including ones that came in through the
//! Bridge.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ff_core::{extract_host, normalize_domain, normalize_host, RuleSet};

use crate::store::{RuleStore, StoreError};

/// Error type for popup input and writes.
#[derive(Debug, thiserror::Error)]
pub enum PopupError {
    #[error("Please enter a domain")]
    Empty,
    #[error("Please enter a valid domain (e.g., youtube.com)")]
    Invalid,
    #[error("Domain already in blocklist")]
    AlreadyListed,
    #[error("The active tab has no site to block")]
    NoCurrentSite,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the popup renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupView {
    pub blocking: bool,
    pub status_label: &'static str,
    pub domains: Vec<String>,
    pub current_site: Option<String>,
    pub current_site_blocked: bool,
}

impl PopupView {
    pub fn render(rules: &RuleSet, current_site: Option<&str>) -> Self {
        Self {
            blocking: rules.enabled,
            status_label: if rules.enabled { "Blocking ON" } else { "Blocking OFF" },
            domains: rules.domains.iter().cloned().collect(),
            current_site: current_site.map(str::to_string),
            current_site_blocked: current_site.is_some_and(|site| rules.contains(site)),
        }
    }
}

pub struct Popup {
    store: Arc<dyn RuleStore>,
    current_site: Option<String>,
}

impl Popup {
    /// Open the popup over the active tab.
    pub fn open(store: Arc<dyn RuleStore>, active_tab_url: Option<&str>) -> Self {
        let current_site = active_tab_url.and_then(extract_host).map(normalize_host);
        Self { store, current_site }
    }

    pub fn current_site(&self) -> Option<&str> {
        self.current_site.as_deref()
    }

    pub async fn view(&self) -> PopupView {
        PopupView::render(&self.store.get().await, self.current_site())
    }

    pub async fn toggle_blocking(&self) -> Result<PopupView, PopupError> {
        let rules = self.store.get().await;
        let next = rules.with_enabled(!rules.enabled);
        info!("Popup: blocking {}", if next.enabled { "on" } else { "off" });
        self.commit(next).await
    }

    pub async fn add_domain(&self, input: &str) -> Result<PopupView, PopupError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(PopupError::Empty);
        }
        let domain = normalize_domain(trimmed)
            .filter(|d| d.contains('.'))
            .ok_or(PopupError::Invalid)?;

        let rules = self.store.get().await;
        if rules.contains(&domain) {
            return Err(PopupError::AlreadyListed);
        }
        debug!("Popup: adding {}", domain);
        self.commit(rules.with_domain(&domain)).await
    }

    pub async fn remove_domain(&self, domain: &str) -> Result<PopupView, PopupError> {
        let rules = self.store.get().await;
        self.commit(rules.without_domain(domain)).await
    }

    /// Quick block: list or unlist the active tab's site.
    pub async fn toggle_current_site(&self) -> Result<PopupView, PopupError> {
        let site = self.current_site.as_deref().ok_or(PopupError::NoCurrentSite)?;
        let rules = self.store.get().await;
        let next = if rules.contains(site) {
            rules.without_domain(site)
        } else {
            rules.with_domain(site)
        };
        self.commit(next).await
    }

    /// Re-render on every store change until the returned task is aborted.
    pub async fn live(&self) -> (watch::Receiver<PopupView>, JoinHandle<()>) {
        let mut changes = self.store.subscribe();
        let (tx, rx) = watch::channel(self.view().await);
        let store = self.store.clone();
        let current_site = self.current_site.clone();

        let task = tokio::spawn(async move {
            loop {
                let rules = match changes.recv().await {
                    Ok(change) => change.new,
                    Err(RecvError::Lagged(_)) => store.get().await,
                    Err(RecvError::Closed) => return,
                };
                tx.send_replace(PopupView::render(&rules, current_site.as_deref()));
            }
        });
        (rx, task)
    }

    async fn commit(&self, rules: RuleSet) -> Result<PopupView, PopupError> {
        self.store.set(rules.clone()).await?;
        Ok(PopupView::render(&rules, self.current_site()))
    }
}
