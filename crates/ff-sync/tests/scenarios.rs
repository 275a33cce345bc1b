//! End-to-end behavior of the site blocker across all contexts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ff_core::{FocusConfig, Request, Response, RuleSet};
use ff_sync::enforcement::PageContent;
use ff_sync::webapp::{BlocklistManager, ExtensionClient, MemoryDocumentStore, PresenceDetector, SaveOutcome};
use ff_sync::{Browser, FileRuleStore, MemoryRuleStore, Origin, PageState, PageWindow, RuleStore};

const WEB_APP: &str = "https://focusflow.example.app/blocklist";

fn browser_with(rules: RuleSet) -> (Arc<MemoryRuleStore>, Browser) {
    let store = Arc::new(MemoryRuleStore::with_rules(rules));
    let browser = Browser::launch(store.clone(), FocusConfig::default());
    (store, browser)
}

fn blocked(domain: &str) -> PageState {
    PageState::Blocked {
        matched_domain: domain.to_string(),
    }
}

#[tokio::test]
async fn scenario_a_exact_host_blocking() {
    let (_store, mut browser) = browser_with(RuleSet::new(["youtube.com"], true));

    let watch = browser.open_tab("https://www.youtube.com/watch?v=x").await;
    let mobile = browser.open_tab("https://m.youtube.com").await;

    assert_eq!(browser.wait_settled(watch).await, Some(blocked("youtube.com")));
    assert_eq!(browser.wait_settled(mobile).await, Some(PageState::Allowed));

    match browser.page(watch).unwrap().content() {
        PageContent::Blocked { html } => assert!(html.contains("youtube.com")),
        other => panic!("expected blocked page, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_b_disable_keeps_open_tabs_blocked_until_reload() {
    let (store, mut browser) = browser_with(RuleSet::new(["youtube.com", "reddit.com", "x.com"], true));

    let mut tabs = Vec::new();
    for url in ["https://youtube.com/", "https://www.reddit.com/r/all", "https://x.com/home"] {
        let tab = browser.open_tab(url).await;
        assert!(browser.wait_settled(tab).await.unwrap().is_blocked());
        tabs.push(tab);
    }

    browser.popup(Some(tabs[0])).toggle_blocking().await.unwrap();
    assert!(!store.get().await.enabled);

    let mut coordinator = browser.coordinator().unwrap().subscribe();
    coordinator.wait_for(|s| !s.rules.enabled && s.broadcasts > 0).await.unwrap();
    assert_eq!(coordinator.borrow().last_report.delivered, 3);

    // Broadcast has been delivered; give the tabs time to process it
    tokio::time::sleep(Duration::from_millis(50)).await;
    for &tab in &tabs {
        assert!(browser.state(tab).unwrap().is_blocked());
    }

    // New navigations see the cached, disabled rules right away
    let fresh = browser.open_tab("https://youtube.com/feed").await;
    assert_eq!(browser.wait_settled(fresh).await, Some(PageState::Allowed));

    for &tab in &tabs {
        browser.reload(tab).await.unwrap();
        assert_eq!(browser.wait_settled(tab).await, Some(PageState::Allowed));
    }
}

#[tokio::test]
async fn scenario_c_malformed_update_from_page_is_rejected() {
    let initial = RuleSet::new(["reddit.com"], true);
    let (store, mut browser) = browser_with(initial.clone());
    let tab = browser.open_tab(WEB_APP).await;
    let window = browser.window(tab).unwrap();

    let client = ExtensionClient::new(window, Duration::from_secs(5));
    let response = client
        .request(&Request::UpdateBlocklist {
            payload: json!({"domains": "not-an-array", "enabled": true}),
        })
        .await
        .unwrap();

    assert!(!response.is_success());
    assert_eq!(store.get().await, initial);
    assert_eq!(browser.coordinator().unwrap().rules(), initial);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_no_extension_shows_notice() {
    let window = PageWindow::new();
    let detector = PresenceDetector::attach(&window);
    let config = FocusConfig::default();

    let start = tokio::time::Instant::now();
    let presence = detector.detect(&config.handshake).await;
    assert!(!presence.installed);
    assert!(start.elapsed() >= config.handshake.announce_span());

    let manager = BlocklistManager::load(
        "user-1",
        Arc::new(MemoryDocumentStore::new()),
        &window,
        detector.subscribe(),
        config.client.request_timeout(),
    )
    .await
    .unwrap();
    assert!(manager.notice().is_some());
    assert_eq!(manager.add_domain("youtube.com").await.unwrap(), SaveOutcome::DisplayOnly);
}

#[tokio::test(start_paused = true)]
async fn handshake_reaches_a_late_listener() {
    let (_store, mut browser) = browser_with(RuleSet::default());
    let tab = browser.open_tab(WEB_APP).await;
    let window = browser.window(tab).unwrap();

    // The page's script attaches after several announcements were lost
    tokio::time::sleep(Duration::from_millis(3_200)).await;
    let detector = PresenceDetector::attach(&window);
    let presence = detector.detect(&browser.config().handshake).await;

    assert!(presence.installed);
    assert_eq!(presence.extension_id.as_deref(), Some("focusflow-dev"));
}

#[tokio::test(start_paused = true)]
async fn web_app_and_popup_stay_in_sync() {
    let (store, mut browser) = browser_with(RuleSet::default());
    let app = browser.open_tab(WEB_APP).await;
    let window = browser.window(app).unwrap();

    let detector = PresenceDetector::attach(&window);
    assert!(detector.detect(&browser.config().handshake).await.installed);

    let documents = Arc::new(MemoryDocumentStore::new());
    let manager = BlocklistManager::load(
        "user-2",
        documents.clone(),
        &window,
        detector.subscribe(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    // Web app to extension
    let popup = browser.popup(None);
    let (mut popup_view, popup_task) = popup.live().await;
    assert_eq!(manager.add_domain("news.ycombinator.com").await.unwrap(), SaveOutcome::Synced);
    assert_eq!(manager.toggle_blocking().await.unwrap(), SaveOutcome::Synced);
    popup_view.wait_for(|v| v.blocking).await.unwrap();
    assert_eq!(popup_view.borrow().domains, vec!["news.ycombinator.com".to_string()]);
    assert_eq!(store.get().await, RuleSet::new(["news.ycombinator.com"], true));

    let hn = browser.open_tab("https://news.ycombinator.com/").await;
    assert_eq!(browser.wait_settled(hn).await, Some(blocked("news.ycombinator.com")));

    // Extension to web app
    let mut app_view = manager.subscribe();
    popup.toggle_blocking().await.unwrap();
    app_view.wait_for(|r| !r.enabled).await.unwrap();
    assert!(!manager.rules().enabled);

    popup_task.abort();
}

#[tokio::test]
async fn repeated_update_is_idempotent() {
    let (store, mut browser) = browser_with(RuleSet::default());
    let tab = browser.open_tab("https://example.com").await;
    browser.wait_settled(tab).await;
    let mut listener = browser.tabs().listen(tab).unwrap();
    let runtime = browser.runtime();

    let update = Request::update(&RuleSet::new(["a.com", "b.com"], true));
    for _ in 0..2 {
        let response = runtime.send_message(Origin::Popup, update.clone()).await.unwrap();
        assert_eq!(response, Response::ok());
    }

    let first = listener.recv().await.unwrap();
    let second = listener.recv().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.get().await, RuleSet::new(["a.com", "b.com"], true));
}

#[tokio::test]
async fn coordinator_restart_rehydrates_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRuleStore::open(dir.path().join("rules.json")));
    let mut browser = Browser::launch(store.clone(), FocusConfig::default());
    let runtime = browser.runtime();

    let rules = RuleSet::new(["youtube.com"], true);
    let response = runtime.send_message(Origin::Popup, Request::update(&rules)).await.unwrap();
    assert!(response.is_success());

    browser.restart_coordinator();
    let response = runtime.send_message(Origin::Popup, Request::GetBlocklist).await.unwrap();
    assert_eq!(response.into_rules(), Some(rules));

    let tab = browser.open_tab("https://www.youtube.com/").await;
    assert_eq!(browser.wait_settled(tab).await, Some(blocked("youtube.com")));
}

#[tokio::test]
async fn unreadable_store_fails_open() {
    let (store, mut browser) = browser_with(RuleSet::new(["youtube.com"], true));
    store.set_available(false);
    browser.restart_coordinator();

    let tab = browser.open_tab("https://youtube.com").await;
    assert_eq!(browser.wait_settled(tab).await, Some(PageState::Allowed));
}

#[tokio::test(start_paused = true)]
async fn open_tabs_converge_after_coordinator_restart() {
    let (store, mut browser) = browser_with(RuleSet::new(["youtube.com"], false));
    let tab = browser.open_tab("https://youtube.com/").await;
    assert_eq!(browser.wait_settled(tab).await, Some(PageState::Allowed));

    browser.suspend_coordinator();
    browser.popup(Some(tab)).toggle_blocking().await.unwrap();
    assert!(store.get().await.enabled);
    browser.restart_coordinator();

    let mut state = browser.watch_state(tab).unwrap();
    tokio::time::timeout(Duration::from_secs(30), state.wait_for(PageState::is_blocked))
        .await
        .expect("open tab never saw the rules written while suspended")
        .unwrap();
    assert_eq!(browser.state(tab), Some(blocked("youtube.com")));
}

#[tokio::test]
async fn page_clients_share_the_bridge_without_crossed_replies() {
    let rules = RuleSet::new(["a.com"], true);
    let (_store, mut browser) = browser_with(rules.clone());
    let tab = browser.open_tab(WEB_APP).await;
    let window = browser.window(tab).unwrap();

    let manager_client = ExtensionClient::new(window.clone(), Duration::from_secs(5));
    let status_client = ExtensionClient::new(window, Duration::from_secs(5));
    let (blocklist, pong) = tokio::join!(
        manager_client.request(&Request::GetBlocklist),
        status_client.request(&Request::Ping)
    );

    assert_eq!(blocklist.unwrap(), Response::Blocklist(rules));
    assert_eq!(pong.unwrap(), Response::pong("focusflow-dev"));
}

#[tokio::test]
async fn coordinator_sees_writes_through_another_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let mut browser = Browser::launch(Arc::new(FileRuleStore::open(&path)), FocusConfig::default());
    let tab = browser.open_tab("https://www.reddit.com/").await;
    assert_eq!(browser.wait_settled(tab).await, Some(PageState::Allowed));

    let rules = RuleSet::new(["reddit.com"], true);
    FileRuleStore::open(&path).set(rules.clone()).await.unwrap();

    let mut coordinator = browser.coordinator().unwrap().subscribe();
    coordinator.wait_for(|s| s.rules == rules).await.unwrap();
    let response = browser
        .runtime()
        .send_message(Origin::Popup, Request::GetBlocklist)
        .await
        .unwrap();
    assert_eq!(response, Response::Blocklist(rules));

    let mut state = browser.watch_state(tab).unwrap();
    state.wait_for(PageState::is_blocked).await.unwrap();
}
