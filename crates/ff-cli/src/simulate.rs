use std::sync::Arc;

use ff_core::{FocusConfig, RuleSet};
use ff_sync::{Browser, MemoryRuleStore, PageState, TabId};

pub fn run(rules: RuleSet, config: FocusConfig, urls: &[String]) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(run_async(rules, config, urls))
}

async fn run_async(rules: RuleSet, config: FocusConfig, urls: &[String]) -> Result<(), String> {
    let store = Arc::new(MemoryRuleStore::with_rules(rules));
    let mut browser = Browser::launch(store, config);

    let mut tabs = Vec::with_capacity(urls.len());
    for url in urls {
        tabs.push((browser.open_tab(url).await, url.as_str()));
    }

    println!("After load:");
    print_states(&browser, &tabs).await;

    let popup = browser.popup(tabs.first().map(|(tab, _)| *tab));
    let view = popup.view().await;
    if view.blocking {
        popup
            .toggle_blocking()
            .await
            .map_err(|e| format!("Failed to disable blocking: {}", e))?;
    }

    if let Some(coordinator) = browser.coordinator() {
        let mut state = coordinator.subscribe();
        state
            .wait_for(|s| !s.rules.enabled)
            .await
            .map_err(|_| "Coordinator stopped".to_string())?;
    }

    println!();
    println!("After disabling from the popup (open tabs keep their state):");
    print_states(&browser, &tabs).await;

    for (tab, _) in &tabs {
        browser
            .reload(*tab)
            .await
            .map_err(|e| format!("Failed to reload tab {}: {}", tab, e))?;
    }

    println!();
    println!("After reload:");
    print_states(&browser, &tabs).await;

    Ok(())
}

async fn print_states(browser: &Browser, tabs: &[(TabId, &str)]) {
    for (tab, url) in tabs {
        let state = match browser.wait_settled(*tab).await {
            Some(PageState::Blocked { matched_domain }) => format!("BLOCKED ({matched_domain})"),
            Some(PageState::Allowed) => "ALLOWED".to_string(),
            Some(other) => format!("{other:?}"),
            None => "CLOSED".to_string(),
        };
        println!("  [{}] {:<40} {}", tab, url, state);
    }
}
