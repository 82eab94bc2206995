//! Browser session lifecycle management.
//!
//! The [`SessionManager`] owns the single shared browser handle. It decides
//! launch-vs-attach, enforces the concurrent-page ceiling, and recovers
//! from disconnection: a watcher task subscribed to the connection's event
//! stream invalidates the handle the moment the underlying process goes
//! away, so the next acquisition transparently re-establishes it.
//!
//! All state transitions (handle swap, page tracking) happen under one
//! mutex-guarded critical section, which keeps the page-count invariant
//! `0 <= count <= max_concurrent_pages` intact under concurrent callers.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ChromebotConfig;
use crate::driver::{BrowserConnection, BrowserDriver, BrowserEvent, DriverError, PageHandle, PageId};
use crate::logging::ChromebotLogger;

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("too many concurrent pages: {limit} already open")]
    Capacity { limit: usize },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Snapshot of the session state; pure read, never touches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub page_count: usize,
}

struct SessionState {
    browser: Option<Arc<dyn BrowserConnection>>,
    open_pages: HashSet<PageId>,
    watcher: Option<JoinHandle<()>>,
}

impl SessionState {
    fn connected_browser(&self) -> Option<Arc<dyn BrowserConnection>> {
        self.browser
            .as_ref()
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    fn invalidate(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.browser = None;
        // Pages cannot outlive their browser.
        self.open_pages.clear();
    }
}

/// Owns the shared browser handle and the page concurrency counter.
pub struct SessionManager<D: BrowserDriver> {
    driver: D,
    config: ChromebotConfig,
    logger: Arc<ChromebotLogger>,
    state: Arc<Mutex<SessionState>>,
}

impl<D: BrowserDriver> SessionManager<D> {
    pub fn new(driver: D, config: ChromebotConfig, logger: Arc<ChromebotLogger>) -> Self {
        SessionManager {
            driver,
            config,
            logger,
            state: Arc::new(Mutex::new(SessionState {
                browser: None,
                open_pages: HashSet::new(),
                watcher: None,
            })),
        }
    }

    pub fn config(&self) -> &ChromebotConfig {
        &self.config
    }

    /// Return the existing browser handle if still connected, establishing
    /// one otherwise.
    ///
    /// When attach mode is configured the manager first tries to attach to
    /// the externally-running browser; if discovery or attachment fails for
    /// any reason it falls back to launching a fresh local process. That
    /// fallback is the single retry in the system: one attempt, no more.
    pub async fn acquire_browser(&self) -> Result<Arc<dyn BrowserConnection>, SessionError> {
        let mut state = self.state.lock().await;

        if let Some(conn) = state.connected_browser() {
            return Ok(conn);
        }
        state.invalidate();

        let conn = if self.config.attach.enabled {
            self.logger.info(
                format!(
                    "connecting to existing browser at {}",
                    self.config.attach.endpoint
                ),
                Some("browser"),
            );
            match self.driver.attach(&self.config.attach.endpoint).await {
                Ok(conn) => conn,
                Err(err) => {
                    self.logger.info(
                        format!("attach failed ({err}), launching new browser"),
                        Some("browser"),
                    );
                    self.driver.launch(&self.config.launch_options()).await?
                }
            }
        } else {
            self.driver.launch(&self.config.launch_options()).await?
        };

        self.logger.info("browser ready", Some("browser"));
        state.browser = Some(conn.clone());
        state.watcher = Some(self.spawn_watcher(conn.clone()));
        Ok(conn)
    }

    /// Watch the connection's event stream: page closes decrement the
    /// tracked set, disconnection invalidates the handle.
    fn spawn_watcher(&self, conn: Arc<dyn BrowserConnection>) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let logger = Arc::clone(&self.logger);
        let mut events = conn.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BrowserEvent::PageClosed { page_id }) => {
                        let mut state = state.lock().await;
                        if state.open_pages.remove(&page_id) {
                            logger.debug(format!("page {page_id} closed"), Some("session"));
                        }
                    }
                    Ok(BrowserEvent::Disconnected) => {
                        logger.info("browser disconnected", Some("browser"));
                        let mut state = state.lock().await;
                        state.browser = None;
                        state.open_pages.clear();
                        if let Some(watcher) = state.watcher.take() {
                            // This is our own handle; dropping it is enough.
                            drop(watcher);
                        }
                        return;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Open a new page, acquiring a browser first if necessary. Fails with
    /// a capacity error once the configured ceiling is reached; the caller
    /// must close an existing page before creating another.
    pub async fn create_page(&self) -> Result<PageHandle, SessionError> {
        let conn = self.acquire_browser().await?;

        let mut state = self.state.lock().await;
        if state.open_pages.len() >= self.config.max_concurrent_pages {
            return Err(SessionError::Capacity {
                limit: self.config.max_concurrent_pages,
            });
        }

        let page = conn.new_page().await?;
        state.open_pages.insert(page.id().clone());
        self.logger.debug(
            format!(
                "opened page {} ({}/{})",
                page.id(),
                state.open_pages.len(),
                self.config.max_concurrent_pages
            ),
            Some("session"),
        );
        Ok(page)
    }

    /// Close a page. Closing an already-closed page is a no-op.
    pub async fn close_page(&self, page: &PageHandle) -> Result<(), SessionError> {
        if !page.is_closed() {
            page.close().await?;
        }
        let mut state = self.state.lock().await;
        state.open_pages.remove(page.id());
        Ok(())
    }

    /// Close the browser, resetting the page count to zero. Idempotent.
    pub async fn close_browser(&self) -> Result<(), SessionError> {
        let conn = {
            let mut state = self.state.lock().await;
            let conn = state.browser.take();
            state.invalidate();
            conn
        };

        if let Some(conn) = conn {
            conn.close().await?;
            self.logger.info("browser closed", Some("browser"));
        }
        Ok(())
    }

    /// Current connectivity and page count.
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            connected: state.connected_browser().is_some(),
            page_count: state.open_pages.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{LaunchOptions, PageDriver};
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct StubPage {
        id: PageId,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PageDriver for StubPage {
        fn id(&self) -> &PageId {
            &self.id
        }

        async fn goto(&self, _url: &str, _timeout: Duration) -> Result<(), DriverError> {
            Ok(())
        }

        async fn current_url(&self) -> Result<String, DriverError> {
            Ok("about:blank".to_string())
        }

        async fn title(&self) -> Result<String, DriverError> {
            Ok(String::new())
        }

        async fn content(&self) -> Result<String, DriverError> {
            Ok(String::new())
        }

        async fn evaluate(&self, _expression: &str) -> Result<JsonValue, DriverError> {
            Ok(JsonValue::Null)
        }

        async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, DriverError> {
            Ok(Vec::new())
        }

        async fn cookies(&self) -> Result<JsonValue, DriverError> {
            Ok(JsonValue::Array(Vec::new()))
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

    struct StubConnection {
        connected: AtomicBool,
        next_page: AtomicUsize,
        events: broadcast::Sender<BrowserEvent>,
    }

    impl StubConnection {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(StubConnection {
                connected: AtomicBool::new(true),
                next_page: AtomicUsize::new(0),
                events,
            })
        }
    }

    #[async_trait]
    impl BrowserConnection for StubConnection {
        async fn new_page(&self) -> Result<PageHandle, DriverError> {
            let id = self.next_page.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubPage {
                id: format!("page-{id}"),
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
    struct StubDriver {
        attach_attempts: AtomicUsize,
        launch_attempts: AtomicUsize,
        fail_attach: bool,
        last: std::sync::Mutex<Option<Arc<StubConnection>>>,
    }

    impl StubDriver {
        fn last_connection(&self) -> Arc<StubConnection> {
            self.last
                .lock()
                .unwrap()
                .clone()
                .expect("no connection established yet")
        }
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        async fn launch(
            &self,
            _options: &LaunchOptions,
        ) -> Result<Arc<dyn BrowserConnection>, DriverError> {
            self.launch_attempts.fetch_add(1, Ordering::SeqCst);
            let conn = StubConnection::new();
            *self.last.lock().unwrap() = Some(conn.clone());
            Ok(conn)
        }

        async fn attach(&self, endpoint: &str) -> Result<Arc<dyn BrowserConnection>, DriverError> {
            self.attach_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach {
                Err(DriverError::Message(format!("{endpoint} unreachable")))
            } else {
                let conn = StubConnection::new();
                *self.last.lock().unwrap() = Some(conn.clone());
                Ok(conn)
            }
        }
    }

    fn quiet_logger() -> Arc<ChromebotLogger> {
        use crate::config::Verbosity;
        Arc::new(ChromebotLogger::new(Verbosity::Minimal))
    }

    fn manager(driver: StubDriver, max_pages: usize) -> SessionManager<StubDriver> {
        let mut config = ChromebotConfig::default();
        config.max_concurrent_pages = max_pages;
        SessionManager::new(driver, config, quiet_logger())
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_unchanged_on_rejection() {
        let session = manager(StubDriver::default(), 2);

        let _a = session.create_page().await.expect("page a");
        let _b = session.create_page().await.expect("page b");
        assert_eq!(session.status().await.page_count, 2);

        let err = session.create_page().await.err().expect("over capacity");
        assert!(matches!(err, SessionError::Capacity { limit: 2 }));
        assert_eq!(session.status().await.page_count, 2);
    }

    #[tokio::test]
    async fn close_page_is_idempotent() {
        let session = manager(StubDriver::default(), 2);
        let page = session.create_page().await.expect("page");
        assert_eq!(session.status().await.page_count, 1);

        session.close_page(&page).await.expect("first close");
        assert_eq!(session.status().await.page_count, 0);

        session.close_page(&page).await.expect("second close");
        assert_eq!(session.status().await.page_count, 0);
    }

    #[tokio::test]
    async fn close_browser_is_idempotent_and_resets_count() {
        let session = manager(StubDriver::default(), 3);
        let _page = session.create_page().await.expect("page");
        assert!(session.status().await.connected);

        session.close_browser().await.expect("first close");
        let status = session.status().await;
        assert!(!status.connected);
        assert_eq!(status.page_count, 0);

        session.close_browser().await.expect("second close");
        assert!(!session.status().await.connected);
    }

    #[tokio::test]
    async fn attach_failure_falls_back_to_launch() {
        let driver = StubDriver {
            fail_attach: true,
            ..StubDriver::default()
        };
        let mut config = ChromebotConfig::default();
        config.attach.enabled = true;
        let session = SessionManager::new(driver, config, quiet_logger());

        let conn = session.acquire_browser().await.expect("fallback launch");
        assert!(conn.is_connected());
        assert_eq!(session.driver.attach_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(session.driver.launch_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_reuses_connected_browser() {
        let session = manager(StubDriver::default(), 2);
        let first = session.acquire_browser().await.expect("first");
        let second = session.acquire_browser().await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(session.driver.launch_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnection_invalidates_handle_and_pages() {
        let session = manager(StubDriver::default(), 3);
        let _conn = session.acquire_browser().await.expect("browser");
        let _page = session.create_page().await.expect("page");
        assert_eq!(session.status().await.page_count, 1);

        // Simulate a spontaneous disconnect observed asynchronously.
        let stub = session.driver.last_connection();
        stub.connected.store(false, Ordering::SeqCst);
        let _ = stub.events.send(BrowserEvent::Disconnected);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = session.status().await;
        assert!(!status.connected);
        assert_eq!(status.page_count, 0);

        // The next acquisition re-establishes a fresh handle.
        let fresh = session.acquire_browser().await.expect("re-establish");
        assert!(fresh.is_connected());
        assert_eq!(session.driver.launch_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn external_page_close_decrements_count() {
        let session = manager(StubDriver::default(), 3);
        let _conn = session.acquire_browser().await.expect("browser");
        let page = session.create_page().await.expect("page");
        assert_eq!(session.status().await.page_count, 1);

        let stub = session.driver.last_connection();
        let _ = stub.events.send(BrowserEvent::PageClosed {
            page_id: page.id().clone(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.status().await.page_count, 0);
    }
}
