//! Enforcement Point
//!
//! One instance per top-level page. It fetches the rule set when injected,
//! decides the page, and re-decides on every broadcast for as long as the
//! page lives. A blocked page stays blocked until it is reloaded.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use ff_core::blocked_page::{redirect_url, render};
use ff_core::config::{EnforcementConfig, EnforcementMode};
use ff_core::{decide, Broadcast, Request, Response, RuleSet, Verdict};

use crate::transport::{Origin, Runtime, TabId};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageState {
    #[default]
    Init,
    AwaitingRules,
    Allowed,
    Blocked { matched_domain: String },
}

impl PageState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Whether the page has left the waiting states.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Allowed | Self::Blocked { .. })
    }
}

/// How long the original content of a blocked page can be seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    None,
    UntilRulesArrive,
}

// =============================================================================
// Page Surface
// =============================================================================

/// What an enforcement strategy can do to a page.
pub trait PageSurface: Send {
    fn url(&self) -> String;
    fn replace_document(&mut self, html: String);
    fn redirect(&mut self, url: String);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    Original,
    Blocked { html: String },
    Redirected { url: String },
}

#[derive(Debug)]
struct PageDocument {
    url: String,
    original_url: String,
    content: PageContent,
}

/// In-memory page, shared between the enforcement point and whoever looks at
/// the tab.
#[derive(Debug, Clone)]
pub struct SharedPage {
    inner: Arc<Mutex<PageDocument>>,
}

impl SharedPage {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            inner: Arc::new(Mutex::new(PageDocument {
                original_url: url.clone(),
                url,
                content: PageContent::Original,
            })),
        }
    }

    /// The URL the tab was navigated to, before any redirect.
    pub fn original_url(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .original_url
            .clone()
    }

    pub fn content(&self) -> PageContent {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .content
            .clone()
    }

    /// Load a fresh document, discarding any enforcement.
    pub fn load(&self, url: impl Into<String>) {
        let url = url.into();
        let mut doc = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        doc.original_url = url.clone();
        doc.url = url;
        doc.content = PageContent::Original;
    }
}

impl PageSurface for SharedPage {
    fn url(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .url
            .clone()
    }

    fn replace_document(&mut self, html: String) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).content =
            PageContent::Blocked { html };
    }

    fn redirect(&mut self, url: String) {
        let mut doc = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        doc.content = PageContent::Redirected { url: url.clone() };
        doc.url = url;
    }
}

// =============================================================================
// Strategies
// =============================================================================

pub trait EnforcementStrategy: Send + Sync {
    fn exposure(&self) -> Exposure;

    /// Apply a blocking verdict to the page.
    fn enforce(&self, verdict: &Verdict, page: &mut dyn PageSurface);
}

/// Replace the rendered document with the blocked page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostLoadReplacement;

impl EnforcementStrategy for PostLoadReplacement {
    fn exposure(&self) -> Exposure {
        Exposure::UntilRulesArrive
    }

    fn enforce(&self, verdict: &Verdict, page: &mut dyn PageSurface) {
        let domain = verdict.matched_domain.as_deref().unwrap_or_default();
        page.replace_document(render(domain));
    }
}

/// Send the page to the extension's blocked page instead.
#[derive(Debug, Clone)]
pub struct PreNavigationRedirect {
    pub blocked_page_url: String,
}

impl EnforcementStrategy for PreNavigationRedirect {
    fn exposure(&self) -> Exposure {
        Exposure::None
    }

    fn enforce(&self, verdict: &Verdict, page: &mut dyn PageSurface) {
        let domain = verdict.matched_domain.as_deref().unwrap_or_default();
        page.redirect(redirect_url(&self.blocked_page_url, domain));
    }
}

pub fn strategy_for(config: &EnforcementConfig) -> Arc<dyn EnforcementStrategy> {
    match config.strategy {
        EnforcementMode::PostLoadReplacement => Arc::new(PostLoadReplacement),
        EnforcementMode::PreNavigationRedirect => Arc::new(PreNavigationRedirect {
            blocked_page_url: config.blocked_page_url.clone(),
        }),
    }
}

// =============================================================================
// Enforcement Point
// =============================================================================

pub struct EnforcementPoint {
    tab: TabId,
    runtime: Runtime,
    strategy: Arc<dyn EnforcementStrategy>,
    page: SharedPage,
    rules_timeout: Duration,
    state: watch::Sender<PageState>,
}

impl EnforcementPoint {
    pub fn new(
        tab: TabId,
        runtime: Runtime,
        strategy: Arc<dyn EnforcementStrategy>,
        page: SharedPage,
        rules_timeout: Duration,
    ) -> (Self, watch::Receiver<PageState>) {
        let (state, rx) = watch::channel(PageState::Init);
        let point = Self {
            tab,
            runtime,
            strategy,
            page,
            rules_timeout,
            state,
        };
        (point, rx)
    }

    pub fn spawn(self, updates: mpsc::UnboundedReceiver<Broadcast>) -> JoinHandle<()> {
        tokio::spawn(self.run(updates))
    }

    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<Broadcast>) {
        self.state.send_replace(PageState::AwaitingRules);

        let initial = {
            let request = self
                .runtime
                .send_message(Origin::Tab(self.tab), Request::GetBlocklist);
            tokio::select! {
                biased;
                Some(update) = updates.recv() => {
                    debug!("Tab {}: broadcast arrived before GET_BLOCKLIST reply", self.tab);
                    update.rules().clone()
                }
                result = tokio::time::timeout(self.rules_timeout, request) => match result {
                    Ok(Ok(Response::Blocklist(rules))) => rules,
                    Ok(Ok(other)) => {
                        warn!("Tab {}: unexpected GET_BLOCKLIST reply {:?}, allowing", self.tab, other);
                        RuleSet::default()
                    }
                    Ok(Err(e)) => {
                        warn!("Tab {}: could not fetch rules: {}, allowing", self.tab, e);
                        RuleSet::default()
                    }
                    Err(_) => {
                        warn!("Tab {}: no rules after {:?}, allowing", self.tab, self.rules_timeout);
                        RuleSet::default()
                    }
                },
            }
        };
        self.apply(&initial);

        while let Some(update) = updates.recv().await {
            self.apply(update.rules());
        }
        debug!("Tab {}: enforcement point detached", self.tab);
    }

    fn apply(&mut self, rules: &RuleSet) {
        if self.state.borrow().is_blocked() {
            // No unblock without a reload
            return;
        }

        let url = self.page.url();
        let verdict = decide(&url, rules);
        if let Some(domain) = verdict.matched_domain.clone().filter(|_| verdict.block) {
            self.strategy.enforce(&verdict, &mut self.page);
            info!("Tab {}: blocked {} (matched {})", self.tab, url, domain);
            self.state.send_replace(PageState::Blocked {
                matched_domain: domain,
            });
        } else {
            self.state.send_if_modified(|state| {
                if *state == PageState::Allowed {
                    return false;
                }
                *state = PageState::Allowed;
                true
            });
        }
    }
}
