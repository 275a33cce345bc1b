use std::path::PathBuf;
use std::time::Duration;

use ff_core::config::HandshakeConfig;
use ff_core::RuleSet;
use serde_json::{json, Value};
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;

pub struct E2eOptions {
    pub chromedriver_url: String,
    pub extension_path: String,
    pub app_url: String,
    pub headless: bool,
}

pub fn run_e2e(opts: E2eOptions) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(run_e2e_async(opts))
}

async fn run_e2e_async(opts: E2eOptions) -> Result<(), String> {
    let extension_path = canonicalize_path(&opts.extension_path)?;

    let mut caps = ChromeCapabilities::new();
    let args = [
        format!("--disable-extensions-except={}", extension_path.display()),
        format!("--load-extension={}", extension_path.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
    ];
    for arg in &args {
        caps.add_arg(arg).map_err(|e| format!("Failed to set chrome arg: {}", e))?;
    }
    if opts.headless {
        caps.add_arg("--headless=new")
            .map_err(|e| format!("Failed to set chrome arg: {}", e))?;
        caps.add_arg("--disable-gpu")
            .map_err(|e| format!("Failed to set chrome arg: {}", e))?;
    }

    let driver = WebDriver::new(&opts.chromedriver_url, caps)
        .await
        .map_err(|e| format!("Failed to connect to chromedriver: {}", e))?;

    let cdp = ChromeDevTools::new(driver.handle.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let extension_id = find_extension_id(&cdp)
        .await
        .ok_or_else(|| "Failed to locate extension service worker".to_string())?;
    let popup_url = format!("chrome-extension://{}/popup.html", extension_id);

    let mut errors = Vec::new();

    if let Err(e) = check_page_has_selector(&driver, &popup_url, "#status").await {
        errors.push(format!("Popup page check failed: {}", e));
    }

    if let Err(e) = check_handshake(&driver, &opts.app_url, &extension_id).await {
        errors.push(format!("Handshake check failed: {}", e));
    }

    if let Err(e) = check_blocking(&driver, &popup_url).await {
        errors.push(format!("Blocking check failed: {}", e));
    }

    driver.quit().await.ok();

    if errors.is_empty() {
        println!("E2E checks passed");
        Ok(())
    } else {
        Err(format!("E2E failed:\n- {}", errors.join("\n- ")))
    }
}

async fn find_extension_id(cdp: &ChromeDevTools) -> Option<String> {
    let targets = cdp.execute_cdp("Target.getTargets").await.ok()?;
    let infos = targets.get("targetInfos")?.as_array()?;
    for info in infos {
        let target_type = info.get("type").and_then(Value::as_str).unwrap_or("");
        let url = info.get("url").and_then(Value::as_str).unwrap_or("");
        if target_type == "service_worker" && url.starts_with("chrome-extension://") {
            let id = url.trim_start_matches("chrome-extension://");
            if let Some(id) = id.split('/').next().filter(|id| !id.is_empty()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

async fn check_page_has_selector(driver: &WebDriver, url: &str, selector: &str) -> WebDriverResult<()> {
    driver.goto(url).await?;
    driver.find(By::Css(selector)).await?;
    Ok(())
}

/// Attach a listener well after load; a retried announcement must still
/// reach it.
async fn check_handshake(driver: &WebDriver, app_url: &str, extension_id: &str) -> Result<(), String> {
    driver
        .goto(app_url)
        .await
        .map_err(|e| format!("Failed to open '{}': {}", app_url, e))?;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let window_ms = HandshakeConfig::default().detect_window().as_millis();
    let script = format!(
        r#"
        const done = arguments[arguments.length - 1];
        const timer = setTimeout(() => done(null), {window_ms});
        window.addEventListener('message', (event) => {{
            if (event.data?.type === 'FOCUSFLOW_EXTENSION_READY') {{
                clearTimeout(timer);
                done(event.data.extensionId);
            }}
        }});
        "#
    );
    let result = driver
        .execute_async(&script, Vec::<Value>::new())
        .await
        .map_err(|e| format!("Failed to wait for announcement: {}", e))?;

    match result.json().as_str() {
        Some(id) if id == extension_id => Ok(()),
        Some(id) => Err(format!("Announced id '{}' does not match '{}'", id, extension_id)),
        None => Err("No announcement within the detection window".to_string()),
    }
}

async fn check_blocking(driver: &WebDriver, popup_url: &str) -> Result<(), String> {
    driver
        .goto(popup_url)
        .await
        .map_err(|e| format!("Failed to open popup: {}", e))?;
    driver
        .execute_async(&seed_rules_script(&RuleSet::new(["example.com"], true)), Vec::<Value>::new())
        .await
        .map_err(|e| format!("Failed to write rules: {}", e))?;

    driver
        .goto("https://www.example.com/")
        .await
        .map_err(|e| format!("Failed to navigate to example.com: {}", e))?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let domain = driver
        .find(By::Id("blocked-domain"))
        .await
        .map_err(|e| format!("Blocked page not shown: {}", e))?
        .text()
        .await
        .map_err(|e| format!("Failed to read blocked domain: {}", e))?;
    if domain != "example.com" {
        return Err(format!("Expected blocked domain 'example.com', got '{}'", domain));
    }
    Ok(())
}

/// Script writing `rules` into `chrome.storage.local`. The switch is stored
/// under both `enabled` and the legacy `isActive` key, so a shell reading
/// either one sees the same value.
fn seed_rules_script(rules: &RuleSet) -> String {
    let stored = json!({
        "domains": rules.domains,
        "enabled": rules.enabled,
        "isActive": rules.enabled,
    });
    format!(
        "const done = arguments[arguments.length - 1];\
         chrome.storage.local.set({stored}, () => done(true));"
    )
}

fn canonicalize_path(path: &str) -> Result<PathBuf, String> {
    std::fs::canonicalize(path).map_err(|e| format!("Failed to resolve '{}': {}", path, e))
}
