//! HTTP boundary tests: the four routes served over a mock driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value as JsonValue, json};
use tokio::sync::broadcast;
use tower::ServiceExt;

use chromebot::config::{ChromebotConfig, Verbosity};
use chromebot::driver::{
    BrowserConnection, BrowserDriver, BrowserEvent, DriverError, LaunchOptions, PageDriver,
    PageHandle, PageId,
};
use chromebot::logging::ChromebotLogger;
use chromebot::server::{AppState, build_router};
use chromebot::session::SessionManager;

struct ApiPage {
    id: PageId,
    url: std::sync::Mutex<String>,
    closed: AtomicBool,
}

#[async_trait]
impl PageDriver for ApiPage {
    fn id(&self) -> &PageId {
        &self.id
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok("api page".to_string())
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok("<html></html>".to_string())
    }

    async fn evaluate(&self, _expression: &str) -> Result<JsonValue, DriverError> {
        Ok(json!(true))
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, DriverError> {
        Ok(vec![1, 2, 3])
    }

    async fn cookies(&self) -> Result<JsonValue, DriverError> {
        Ok(json!([]))
    }

    async fn back(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn forward(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn reload(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn wait_for_navigation(&self, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn frame(&self, frame_selector: &str) -> Result<PageHandle, DriverError> {
        Err(DriverError::FrameResolution(frame_selector.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ApiConnection {
    connected: AtomicBool,
    next_page: AtomicUsize,
    events: broadcast::Sender<BrowserEvent>,
}

#[async_trait]
impl BrowserConnection for ApiConnection {
    async fn new_page(&self) -> Result<PageHandle, DriverError> {
        let id = self.next_page.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ApiPage {
            id: format!("page-{id}"),
            url: std::sync::Mutex::new("about:blank".to_string()),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct ApiDriver;

#[async_trait]
impl BrowserDriver for ApiDriver {
    async fn launch(
        &self,
        _options: &LaunchOptions,
    ) -> Result<Arc<dyn BrowserConnection>, DriverError> {
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(ApiConnection {
            connected: AtomicBool::new(true),
            next_page: AtomicUsize::new(0),
            events,
        }))
    }

    async fn attach(&self, _endpoint: &str) -> Result<Arc<dyn BrowserConnection>, DriverError> {
        self.launch(&LaunchOptions::default()).await
    }
}

fn test_app() -> Router {
    let mut config = ChromebotConfig::default();
    config.max_concurrent_pages = 2;
    let logger = Arc::new(ChromebotLogger::new(Verbosity::Minimal));
    let session = Arc::new(SessionManager::new(ApiDriver, config, logger.clone()));
    build_router(AppState::new(session, logger))
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, JsonValue) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: JsonValue) -> (StatusCode, JsonValue) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reports_disconnected_before_launch() {
    let app = test_app();
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["browser"], "disconnected");
    assert_eq!(body["pages"], 0);
}

#[tokio::test]
async fn launch_brings_up_browser_and_page() {
    let app = test_app();

    let (status, body) = post_json(&app, "/launch", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["action"], "launch");
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["error"], JsonValue::Null);

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["browser"], "connected");
    assert_eq!(health["pages"], 1);
}

#[tokio::test]
async fn execute_auto_acquires_a_page() {
    let app = test_app();

    let (status, body) = post_json(&app, "/execute", json!({ "action": "getTitle" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["title"], "api page");

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["browser"], "connected");
    assert_eq!(health["pages"], 1);
}

#[tokio::test]
async fn execute_reuses_the_current_page() {
    let app = test_app();

    let (_, body) = post_json(
        &app,
        "/execute",
        json!({ "action": "navigate", "params": { "url": "https://example.com/" } }),
    )
    .await;
    assert_eq!(body["success"], json!(true));

    let (_, body) = post_json(&app, "/execute", json!({ "action": "getUrl" })).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["url"], "https://example.com/");

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["pages"], 1);
}

#[tokio::test]
async fn unknown_actions_travel_as_http_200_failure_envelopes() {
    let app = test_app();

    let (status, body) = post_json(&app, "/execute", json!({ "action": "explode" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["action"], "explode");
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("Unknown action: explode")
    );
}

#[tokio::test]
async fn close_is_idempotent_and_resets_state() {
    let app = test_app();

    let (_, launch) = post_json(&app, "/launch", json!({})).await;
    assert_eq!(launch["success"], json!(true));

    let (status, body) = post_json(&app, "/close", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["status"], "closed");

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["browser"], "disconnected");
    assert_eq!(health["pages"], 0);

    let (_, body) = post_json(&app, "/close", json!({})).await;
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn execute_after_close_reacquires_everything() {
    let app = test_app();

    let (_, _) = post_json(&app, "/launch", json!({})).await;
    let (_, _) = post_json(&app, "/close", json!({})).await;

    let (_, body) = post_json(&app, "/execute", json!({ "action": "getTitle" })).await;
    assert_eq!(body["success"], json!(true));

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["browser"], "connected");
    assert_eq!(health["pages"], 1);
}
