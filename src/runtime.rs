//! Chromiumoxide-backed driver implementation.
//!
//! Provides the production implementation of the [`crate::driver`] traits on
//! top of the `chromiumoxide` crate: launching a local Chrome, attaching to
//! an already-running one via its debug port, and driving pages over CDP.
//! Frame-scoped capabilities route scripts through the nested browsing
//! context resolved from a frame selector.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::EventTargetDestroyed;
use chromiumoxide::page::{Page as ChromiumPage, ScreenshotParams};
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    handler::Handler,
};
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::driver::{
    BrowserConnection, BrowserDriver, BrowserEvent, DriverError, LaunchOptions, PageDriver,
    PageHandle, PageId,
};

/// How long a discovery query against the debug endpoint may take before
/// attach is considered failed.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 32;

fn classify_error(err: impl std::fmt::Display) -> DriverError {
    let text = err.to_string();
    if text.contains("AlreadyClosed")
        || text.contains("ConnectionClosed")
        || text.contains("channel closed")
    {
        DriverError::ConnectionLost(text)
    } else {
        DriverError::Message(text)
    }
}

fn classify_script_error(err: impl std::fmt::Display) -> DriverError {
    match classify_error(err) {
        DriverError::Message(text) => DriverError::ScriptException(text),
        other => other,
    }
}

// ── Debug-endpoint discovery ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugVersionInfo {
    web_socket_debugger_url: Option<String>,
}

/// One entry from the `/json/list` target listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugTarget {
    #[serde(rename = "type", default)]
    target_type: String,
    web_socket_debugger_url: Option<String>,
}

fn first_page_ws_url(targets: &[DebugTarget]) -> Option<String> {
    targets
        .iter()
        .find(|target| target.target_type == "page")
        .and_then(|target| target.web_socket_debugger_url.clone())
}

/// Resolve a connectable WebSocket URL from a browser debug endpoint,
/// preferring the browser-level endpoint and falling back to the first
/// available top-level page target.
async fn resolve_debugger_url(http: &HttpClient, endpoint: &str) -> Result<String, DriverError> {
    let base = endpoint.trim_end_matches('/');

    let version: Result<DebugVersionInfo, DriverError> = async {
        let response = http
            .get(format!("{base}/json/version"))
            .send()
            .await
            .map_err(|err| DriverError::Message(format!("discovery query failed: {err}")))?;
        response
            .json()
            .await
            .map_err(|err| DriverError::Message(format!("invalid discovery response: {err}")))
    }
    .await;

    if let Ok(info) = version {
        if let Some(url) = info.web_socket_debugger_url {
            return Ok(url);
        }
    }

    let targets: Vec<DebugTarget> = http
        .get(format!("{base}/json/list"))
        .send()
        .await
        .map_err(|err| DriverError::Message(format!("discovery query failed: {err}")))?
        .json()
        .await
        .map_err(|err| DriverError::Message(format!("invalid discovery response: {err}")))?;

    first_page_ws_url(&targets).ok_or_else(|| {
        DriverError::Message(format!("no connectable page target found at {endpoint}"))
    })
}

// ── Driver ──────────────────────────────────────────────────────────────

/// Driver that launches or attaches to Chrome via CDP.
#[derive(Debug, Clone)]
pub struct CdpDriver {
    http: HttpClient,
}

impl CdpDriver {
    pub fn new() -> Self {
        let http = HttpClient::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        CdpDriver { http }
    }
}

impl Default for CdpDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Arc<dyn BrowserConnection>, DriverError> {
        let config = build_browser_config(options)?;
        let (browser, handler) = Browser::launch(config).await.map_err(classify_error)?;
        let conn = CdpBrowser::start(browser, handler).await?;
        Ok(conn)
    }

    async fn attach(&self, endpoint: &str) -> Result<Arc<dyn BrowserConnection>, DriverError> {
        let ws_url = resolve_debugger_url(&self.http, endpoint).await?;
        let (browser, handler) = Browser::connect(ws_url).await.map_err(classify_error)?;
        let conn = CdpBrowser::start(browser, handler).await?;
        Ok(conn)
    }
}

fn build_browser_config(options: &LaunchOptions) -> Result<BrowserConfig, DriverError> {
    let viewport = chromiumoxide::handler::viewport::Viewport {
        width: options.viewport.width,
        height: options.viewport.height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: options.viewport.width >= options.viewport.height,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder();

    if let Some(path) = &options.executable {
        builder = builder.chrome_executable(path);
    }

    let builder = builder.viewport(viewport).args(options.args.clone());

    let builder = if options.headless {
        builder
    } else {
        builder.with_head()
    };

    let builder = match &options.user_data_dir {
        Some(dir) => builder.user_data_dir(dir),
        None => builder,
    };

    builder.build().map_err(DriverError::Message)
}

// ── Browser connection ──────────────────────────────────────────────────

/// Live CDP connection to a browser process.
pub struct CdpBrowser {
    browser: Mutex<Option<Browser>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<BrowserEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CdpBrowser {
    async fn start(browser: Browser, handler: Handler) -> Result<Arc<Self>, DriverError> {
        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handler_task = spawn_handler(handler, connected.clone(), events.clone());
        let monitor_task = spawn_target_monitor(&browser, events.clone()).await?;

        Ok(Arc::new(CdpBrowser {
            browser: Mutex::new(Some(browser)),
            connected,
            events,
            tasks: std::sync::Mutex::new(vec![handler_task, monitor_task]),
        }))
    }
}

fn spawn_handler(
    mut handler: Handler,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<BrowserEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                eprintln!("cdp handler error: {err}");
            }
        }
        // The event stream only ends when the connection is gone.
        connected.store(false, Ordering::SeqCst);
        let _ = events.send(BrowserEvent::Disconnected);
    })
}

async fn spawn_target_monitor(
    browser: &Browser,
    events: broadcast::Sender<BrowserEvent>,
) -> Result<JoinHandle<()>, DriverError> {
    let mut destroyed = browser
        .event_listener::<EventTargetDestroyed>()
        .await
        .map_err(classify_error)?;

    Ok(tokio::spawn(async move {
        while let Some(event) = destroyed.next().await {
            let page_id = event.target_id.as_ref().to_string();
            let _ = events.send(BrowserEvent::PageClosed { page_id });
        }
    }))
}

#[async_trait]
impl BrowserConnection for CdpBrowser {
    async fn new_page(&self) -> Result<PageHandle, DriverError> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or(DriverError::NotConnected)?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(classify_error)?;
        Ok(Arc::new(CdpPage::new(page)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        let browser = {
            let mut guard = self.browser.lock().await;
            guard.take()
        };

        if let Some(mut browser) = browser {
            self.connected.store(false, Ordering::SeqCst);
            if let Err(err) = browser.close().await {
                eprintln!("browser close returned error: {err}");
            }
            let _ = browser.wait().await;
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }
}

// ── Pages ───────────────────────────────────────────────────────────────

/// One browsing tab driven over CDP.
pub struct CdpPage {
    id: PageId,
    page: ChromiumPage,
    closed: Arc<AtomicBool>,
}

/// Evaluate an expression in the top document of a page.
async fn raw_eval(page: &ChromiumPage, expression: &str) -> Result<JsonValue, DriverError> {
    let result = page
        .evaluate(expression)
        .await
        .map_err(classify_script_error)?;
    Ok(result.value().cloned().unwrap_or(JsonValue::Null))
}

impl CdpPage {
    fn new(page: ChromiumPage) -> Self {
        let id = page.target_id().as_ref().to_string();
        CdpPage {
            id,
            page,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn eval(&self, expression: &str) -> Result<JsonValue, DriverError> {
        raw_eval(&self.page, expression).await
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    fn id(&self) -> &PageId {
        &self.id
    }

    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let navigation = async {
            self.page.goto(url).await?;
            // Settle until network quiescence before reporting completion.
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };

        match tokio::time::timeout(timeout, navigation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => match classify_error(err) {
                DriverError::Message(text) => Err(DriverError::Navigation(text)),
                other => Err(other),
            },
            Err(_) => Err(DriverError::Navigation(format!(
                "timed out after {}ms loading {url}",
                timeout.as_millis()
            ))),
        }
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let url = self.page.url().await.map_err(classify_error)?;
        Ok(url.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, DriverError> {
        let title = self.page.get_title().await.map_err(classify_error)?;
        Ok(title.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.page.content().await.map_err(classify_error)
    }

    async fn evaluate(&self, expression: &str) -> Result<JsonValue, DriverError> {
        self.eval(expression).await
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(full_page)
                    .build(),
            )
            .await
            .map_err(classify_error)
    }

    async fn cookies(&self) -> Result<JsonValue, DriverError> {
        let cookies = self.page.get_cookies().await.map_err(classify_error)?;
        serde_json::to_value(cookies).map_err(|err| DriverError::Message(err.to_string()))
    }

    async fn back(&self) -> Result<(), DriverError> {
        self.eval("history.back()").await?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn forward(&self) -> Result<(), DriverError> {
        self.eval("history.forward()").await?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn reload(&self) -> Result<(), DriverError> {
        self.page.reload().await.map_err(classify_error)?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> Result<bool, DriverError> {
        match tokio::time::timeout(timeout, self.page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(classify_error(err)),
            Err(_) => Ok(false),
        }
    }

    async fn frame(&self, frame_selector: &str) -> Result<PageHandle, DriverError> {
        probe_frame(&self.page, &[], frame_selector).await?;
        Ok(Arc::new(CdpFrame {
            id: format!("{}::{frame_selector}", self.id),
            page: self.page.clone(),
            closed: self.closed.clone(),
            chain: vec![frame_selector.to_string()],
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.page.clone().close().await.map_err(classify_error)
    }
}

/// A capability scoped to a nested browsing context. Scripts are routed
/// through the frame's own realm via `contentWindow.eval`, so the same
/// handler contracts apply inside the frame. Page-level operations
/// (navigation, screenshots, history) are not available here.
pub struct CdpFrame {
    id: PageId,
    page: ChromiumPage,
    closed: Arc<AtomicBool>,
    /// Frame selectors from the top document down to this context.
    chain: Vec<String>,
}

impl CdpFrame {
    async fn eval(&self, expression: &str) -> Result<JsonValue, DriverError> {
        let wrapped = frame_eval_expression(&self.chain, expression)
            .map_err(|err| DriverError::Message(err.to_string()))?;
        raw_eval(&self.page, &wrapped).await
    }
}

#[async_trait]
impl PageDriver for CdpFrame {
    fn id(&self) -> &PageId {
        &self.id
    }

    async fn goto(&self, _url: &str, _timeout: Duration) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("navigation inside a frame"))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let value = self.eval("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn title(&self) -> Result<String, DriverError> {
        let value = self.eval("document.title").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn content(&self) -> Result<String, DriverError> {
        let value = self.eval("document.documentElement.outerHTML").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn evaluate(&self, expression: &str) -> Result<JsonValue, DriverError> {
        self.eval(expression).await
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Unsupported("screenshot inside a frame"))
    }

    async fn cookies(&self) -> Result<JsonValue, DriverError> {
        Err(DriverError::Unsupported("cookie access inside a frame"))
    }

    async fn back(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("history traversal inside a frame"))
    }

    async fn forward(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("history traversal inside a frame"))
    }

    async fn reload(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("reload inside a frame"))
    }

    async fn wait_for_navigation(&self, _timeout: Duration) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("navigation waits inside a frame"))
    }

    async fn frame(&self, frame_selector: &str) -> Result<PageHandle, DriverError> {
        probe_frame(&self.page, &self.chain, frame_selector).await?;
        let mut chain = self.chain.clone();
        chain.push(frame_selector.to_string());
        Ok(Arc::new(CdpFrame {
            id: format!("{}::{frame_selector}", self.id),
            page: self.page.clone(),
            closed: self.closed.clone(),
            chain,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("closing a frame context"))
    }
}

// ── Frame resolution plumbing ───────────────────────────────────────────

/// Expression probing whether `selector`, looked up inside the context
/// addressed by `outer`, resolves to an element with an accessible content
/// document.
fn frame_probe_expression(outer: &[String], selector: &str) -> Result<String, serde_json::Error> {
    let sel = serde_json::to_string(selector)?;
    let probe = format!(
        "(function() {{
            const el = document.querySelector({sel});
            if (!el) {{
                return 'missing';
            }}
            try {{
                return (el.contentDocument && el.contentWindow) ? 'ok' : 'blocked';
            }} catch (err) {{
                return 'blocked';
            }}
        }})()"
    );
    frame_eval_expression(outer, &probe)
}

/// Run the frame probe against the top document and convert a missing or
/// blocked frame anywhere along the chain into a frame-resolution error
/// naming the requested selector.
async fn probe_frame(
    page: &ChromiumPage,
    outer: &[String],
    selector: &str,
) -> Result<(), DriverError> {
    let expression = frame_probe_expression(outer, selector)
        .map_err(|err| DriverError::Message(err.to_string()))?;

    let result = match raw_eval(page, &expression).await {
        Ok(value) => value,
        // An unresolvable OUTER frame throws inside the wrapper.
        Err(DriverError::ScriptException(_)) => {
            return Err(DriverError::FrameResolution(selector.to_string()));
        }
        Err(other) => return Err(other),
    };

    match result.as_str() {
        Some("ok") => Ok(()),
        _ => Err(DriverError::FrameResolution(selector.to_string())),
    }
}

/// Wrap `expression` so it evaluates inside the nested browsing context
/// addressed by `chain`, outermost selector first. An empty chain returns
/// the expression unchanged.
fn frame_eval_expression(chain: &[String], expression: &str) -> Result<String, serde_json::Error> {
    let mut script = expression.to_string();
    for selector in chain.iter().rev() {
        let sel = serde_json::to_string(selector)?;
        let inner = serde_json::to_string(&script)?;
        script = format!(
            "(function() {{
                const frame = document.querySelector({sel});
                if (!frame) {{
                    throw new Error('Frame not found: ' + {sel});
                }}
                let doc = null;
                try {{ doc = frame.contentDocument; }} catch (err) {{ doc = null; }}
                if (!doc || !frame.contentWindow) {{
                    throw new Error('Frame not accessible: ' + {sel});
                }}
                return frame.contentWindow.eval({inner});
            }})()"
        );
    }
    Ok(script)
}
