//! Simulated browser
//!
//! Wires the contexts together the way the extension platform does: one
//! coordinator per browser, and one enforcement point plus one Bridge
//! injected into every web page. Privileged pages get nothing injected.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ff_core::config::EnforcementMode;
use ff_core::url::extract_scheme;
use ff_core::{FocusConfig, Request, Response};

use crate::bridge::{Bridge, BridgeHandle};
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::enforcement::{
    strategy_for, EnforcementPoint, EnforcementStrategy, PageState, PageSurface, SharedPage,
};
use crate::popup::Popup;
use crate::store::RuleStore;
use crate::transport::{Origin, PageWindow, Runtime, TabDirectory, TabId, TransportError};

struct TabContexts {
    page: SharedPage,
    window: PageWindow,
    state: watch::Receiver<PageState>,
    enforcement: Option<JoinHandle<()>>,
    bridge: Option<BridgeHandle>,
}

impl TabContexts {
    fn fixed(page: SharedPage, state: PageState) -> Self {
        Self {
            page,
            window: PageWindow::new(),
            state: watch::channel(state).1,
            enforcement: None,
            bridge: None,
        }
    }

    fn teardown(self) {
        if let Some(task) = self.enforcement {
            task.abort();
        }
        if let Some(bridge) = self.bridge {
            bridge.shutdown();
        }
    }
}

pub struct Browser {
    config: FocusConfig,
    store: Arc<dyn RuleStore>,
    tabs: TabDirectory,
    runtime: Runtime,
    strategy: Arc<dyn EnforcementStrategy>,
    coordinator: Option<CoordinatorHandle>,
    pages: HashMap<TabId, TabContexts>,
}

impl Browser {
    /// Start the browser and its coordinator. Must be called inside a tokio
    /// runtime.
    pub fn launch(store: Arc<dyn RuleStore>, config: FocusConfig) -> Self {
        let tabs = TabDirectory::new();
        let runtime = Runtime::new();
        let strategy = strategy_for(&config.enforcement);
        let coordinator = Coordinator::spawn(store.clone(), tabs.clone(), runtime.clone(), &config.extension_id);
        info!("Browser launched with {:?} enforcement", config.enforcement.strategy);

        Self {
            config,
            store,
            tabs,
            runtime,
            strategy,
            coordinator: Some(coordinator),
            pages: HashMap::new(),
        }
    }

    pub fn config(&self) -> &FocusConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RuleStore> {
        self.store.clone()
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime.clone()
    }

    pub fn tabs(&self) -> &TabDirectory {
        &self.tabs
    }

    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        self.coordinator.as_ref()
    }

    /// Tear the background worker down, as the platform does when idle.
    pub fn suspend_coordinator(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            info!("Suspending coordinator");
            coordinator.shutdown();
        }
    }

    pub fn restart_coordinator(&mut self) {
        self.suspend_coordinator();
        info!("Restarting coordinator");
        self.coordinator = Some(Coordinator::spawn(
            self.store.clone(),
            self.tabs.clone(),
            self.runtime.clone(),
            &self.config.extension_id,
        ));
    }

    pub async fn open_tab(&mut self, url: &str) -> TabId {
        let tab = self.tabs.open(url);
        debug!("Opened tab {} at {}", tab, url);
        self.load(tab, url).await;
        tab
    }

    pub fn close_tab(&mut self, tab: TabId) {
        if let Some(contexts) = self.pages.remove(&tab) {
            contexts.teardown();
        }
        self.tabs.close(tab);
    }

    /// Load a new URL in an existing tab.
    pub async fn navigate(&mut self, tab: TabId, url: &str) -> Result<(), TransportError> {
        self.tabs.navigate(tab, url)?;
        self.load(tab, url).await;
        Ok(())
    }

    /// Reload the tab's original URL, dropping any enforcement on it.
    pub async fn reload(&mut self, tab: TabId) -> Result<(), TransportError> {
        let url = self
            .pages
            .get(&tab)
            .map(|contexts| contexts.page.original_url())
            .ok_or(TransportError::NoSuchTab(tab))?;
        self.navigate(tab, &url).await
    }

    pub fn page(&self, tab: TabId) -> Option<SharedPage> {
        self.pages.get(&tab).map(|contexts| contexts.page.clone())
    }

    pub fn window(&self, tab: TabId) -> Option<PageWindow> {
        self.pages.get(&tab).map(|contexts| contexts.window.clone())
    }

    pub fn state(&self, tab: TabId) -> Option<PageState> {
        self.pages.get(&tab).map(|contexts| contexts.state.borrow().clone())
    }

    pub fn watch_state(&self, tab: TabId) -> Option<watch::Receiver<PageState>> {
        self.pages.get(&tab).map(|contexts| contexts.state.clone())
    }

    /// Wait until the tab has been decided.
    pub async fn wait_settled(&self, tab: TabId) -> Option<PageState> {
        let mut state = self.watch_state(tab)?;
        if state.wait_for(PageState::is_settled).await.is_err() {
            debug!("Tab {}: enforcement stopped before settling", tab);
        }
        let settled = state.borrow().clone();
        Some(settled)
    }

    /// Open the popup over a tab, or over no page.
    pub fn popup(&self, active_tab: Option<TabId>) -> Popup {
        let url = active_tab.and_then(|tab| self.tabs.url(tab));
        Popup::open(self.store.clone(), url.as_deref())
    }

    pub fn open_tabs(&self) -> Vec<TabId> {
        self.tabs.ids()
    }

    async fn load(&mut self, tab: TabId, url: &str) {
        if let Some(previous) = self.pages.remove(&tab) {
            previous.teardown();
        }
        let page = SharedPage::new(url);

        if extract_scheme(url).is_none() {
            debug!("Tab {}: {} is not a web page, nothing injected", tab, url);
            self.pages.insert(tab, TabContexts::fixed(page, PageState::Allowed));
            return;
        }

        if self.config.enforcement.strategy == EnforcementMode::PreNavigationRedirect {
            if let Some(contexts) = self.check_navigation(tab, url, &page).await {
                self.pages.insert(tab, contexts);
                return;
            }
        }

        let contexts = match self.inject(tab, page.clone()) {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!("Tab {}: could not inject content scripts: {}", tab, e);
                TabContexts::fixed(page, PageState::Allowed)
            }
        };
        self.pages.insert(tab, contexts);
    }

    /// Ask the coordinator before the main-frame load. Returns the blocked
    /// tab when the navigation was redirected.
    async fn check_navigation(&self, tab: TabId, url: &str, page: &SharedPage) -> Option<TabContexts> {
        let request = Request::CheckNavigation { url: url.to_string() };
        let verdict = match self.runtime.send_message(Origin::Extension, request).await {
            Ok(Response::Verdict(verdict)) => verdict,
            Ok(other) => {
                warn!("Tab {}: unexpected CHECK_NAVIGATION reply {:?}", tab, other);
                return None;
            }
            Err(e) => {
                warn!("Tab {}: navigation check failed: {}, loading", tab, e);
                return None;
            }
        };
        let domain = verdict.matched_domain.clone().filter(|_| verdict.block)?;

        let mut surface = page.clone();
        self.strategy.enforce(&verdict, &mut surface);
        let target = surface.url();
        // The blocked page is an extension page: no content scripts
        if let Err(e) = self.tabs.navigate(tab, &target) {
            debug!("Tab {}: {}", tab, e);
        }
        info!("Tab {}: redirected {} to {}", tab, url, target);
        Some(TabContexts::fixed(
            page.clone(),
            PageState::Blocked { matched_domain: domain },
        ))
    }

    fn inject(&self, tab: TabId, page: SharedPage) -> Result<TabContexts, TransportError> {
        let enforcement_updates = self.tabs.listen(tab)?;
        let bridge_updates = self.tabs.listen(tab)?;
        let window = PageWindow::new();

        let (point, state) = EnforcementPoint::new(
            tab,
            self.runtime.clone(),
            self.strategy.clone(),
            page.clone(),
            self.config.enforcement.rules_timeout(),
        );
        let enforcement = point.spawn(enforcement_updates);

        let bridge = Bridge::new(
            tab,
            self.config.extension_id.clone(),
            self.runtime.clone(),
            window.clone(),
            self.config.handshake.clone(),
        )
        .spawn(bridge_updates);

        Ok(TabContexts {
            page,
            window,
            state,
            enforcement: Some(enforcement),
            bridge: Some(bridge),
        })
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        for (_, contexts) in self.pages.drain() {
            contexts.teardown();
        }
        self.suspend_coordinator();
    }
}
