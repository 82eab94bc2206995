//! End-to-end smoke tests against a real Chrome/Chromium.
//!
//! These are marked `#[ignore]` because they require `CHROMEBOT_CHROME_BIN`
//! pointing at a Chrome/Chromium binary. Running them exercises the full
//! stack: CDP launch, session tracking, dispatch, and envelope encoding
//! against a live browser.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use chromebot::actions::execute_action;
use chromebot::config::{ChromebotConfig, Verbosity};
use chromebot::envelope::JsonObject;
use chromebot::logging::ChromebotLogger;
use chromebot::runtime::CdpDriver;
use chromebot::session::SessionManager;

fn chrome_bin() -> Option<PathBuf> {
    match env::var("CHROMEBOT_CHROME_BIN") {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

fn smoke_session() -> Result<SessionManager<CdpDriver>> {
    let chrome = chrome_bin().context("CHROMEBOT_CHROME_BIN must be set")?;

    let user_data_dir = tempfile::Builder::new()
        .prefix("chromebot-smoke")
        .tempdir()
        .context("failed to create temporary user data dir")?;
    let user_data_path = user_data_dir.path().to_path_buf();
    std::mem::forget(user_data_dir);

    let mut config = ChromebotConfig::default().with_headless(true);
    config.chrome_executable = Some(chrome);
    config.user_data_dir = Some(user_data_path);
    config.verbose = Verbosity::Minimal;

    let logger = Arc::new(ChromebotLogger::new(config.verbose));
    Ok(SessionManager::new(CdpDriver::new(), config, logger))
}

fn params(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

#[tokio::test]
#[ignore = "Requires CHROMEBOT_CHROME_BIN pointing at Chrome/Chromium"]
#[serial_test::serial]
async fn navigate_title_and_screenshot_round_trip() -> Result<()> {
    let session = smoke_session()?;
    let page = session.create_page().await.context("create page")?;

    let envelope = execute_action(
        "navigate",
        page.as_ref(),
        &params(json!({ "url": "https://example.com/" })),
    )
    .await;
    assert!(envelope.success, "navigate failed: {:?}", envelope.error);
    assert!(
        envelope.data["url"]
            .as_str()
            .unwrap()
            .contains("example.com")
    );

    let envelope = execute_action("getTitle", page.as_ref(), &JsonObject::new()).await;
    assert!(envelope.success);
    assert!(!envelope.data["title"].as_str().unwrap().is_empty());

    let envelope = execute_action("screenshot", page.as_ref(), &JsonObject::new()).await;
    assert!(envelope.success, "screenshot failed: {:?}", envelope.error);
    assert!(!envelope.data["image"].as_str().unwrap().is_empty());

    session.close_browser().await.context("close browser")?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires CHROMEBOT_CHROME_BIN pointing at Chrome/Chromium"]
#[serial_test::serial]
async fn evaluate_and_dom_queries_work_on_a_live_page() -> Result<()> {
    let session = smoke_session()?;
    let page = session.create_page().await.context("create page")?;

    let envelope = execute_action(
        "navigate",
        page.as_ref(),
        &params(json!({ "url": "https://example.com/" })),
    )
    .await;
    assert!(envelope.success, "navigate failed: {:?}", envelope.error);

    let envelope = execute_action(
        "evaluate",
        page.as_ref(),
        &params(json!({ "script": "1 + 1" })),
    )
    .await;
    assert!(envelope.success);
    assert_eq!(envelope.data["result"], json!(2));

    let envelope = execute_action(
        "getText",
        page.as_ref(),
        &params(json!({ "selector": "h1" })),
    )
    .await;
    assert!(envelope.success);
    assert!(envelope.data["text"].as_str().unwrap().contains("Example"));

    let envelope = execute_action(
        "isVisible",
        page.as_ref(),
        &params(json!({ "selector": "#does-not-exist" })),
    )
    .await;
    assert!(envelope.success);
    assert_eq!(envelope.data["visible"], json!(false));

    session.close_browser().await.context("close browser")?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires CHROMEBOT_CHROME_BIN pointing at Chrome/Chromium"]
#[serial_test::serial]
async fn session_status_tracks_the_page_count() -> Result<()> {
    let session = smoke_session()?;

    let status = session.status().await;
    assert!(!status.connected);
    assert_eq!(status.page_count, 0);

    let page = session.create_page().await.context("create page")?;
    let status = session.status().await;
    assert!(status.connected);
    assert_eq!(status.page_count, 1);

    session.close_page(&page).await.context("close page")?;
    let status = session.status().await;
    assert_eq!(status.page_count, 0);

    session.close_browser().await.context("close browser")?;
    let status = session.status().await;
    assert!(!status.connected);
    Ok(())
}
