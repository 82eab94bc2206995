//! The browser-control capability boundary.
//!
//! Everything that actually knows how to talk to a browser lives behind the
//! traits in this module: [`BrowserDriver`] acquires a browser process,
//! [`BrowserConnection`] represents an established connection, and
//! [`PageDriver`] is the page-like capability every action handler is
//! polymorphic over. The production implementation backed by `chromiumoxide`
//! lives in [`crate::runtime`]; tests substitute in-memory mocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;

/// Stable identifier for one browsing tab/context. The CDP driver uses the
/// target id; mocks use synthetic ids.
pub type PageId = String;

/// Shared handle to an open page.
pub type PageHandle = Arc<dyn PageDriver>;

/// Viewport dimensions applied to freshly launched browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280,
            height: 720,
        }
    }
}

/// Parameters for launching a fresh local browser process.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub viewport: Viewport,
    pub args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
    pub executable: Option<PathBuf>,
}

/// Asynchronous notifications emitted by a [`BrowserConnection`].
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// The underlying process/connection was lost (crash, manual close,
    /// network drop). The handle must be treated as invalid from this point.
    Disconnected,
    /// A page closed, whether explicitly or as a side effect of browser
    /// shutdown.
    PageClosed { page_id: PageId },
}

/// Errors surfaced by driver implementations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser is not connected")]
    NotConnected,
    #[error("connection to the browser was lost: {0}")]
    ConnectionLost(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script error: {0}")]
    ScriptException(String),
    #[error("no accessible frame matches selector '{0}'")]
    FrameResolution(String),
    #[error("operation not supported here: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Message(String),
}

/// Entry point for acquiring a controllable browser, either by launching a
/// new process or attaching to one that is already running.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch a brand-new local browser process.
    async fn launch(&self, options: &LaunchOptions)
    -> Result<Arc<dyn BrowserConnection>, DriverError>;

    /// Attach to an externally-running browser via its debug endpoint,
    /// preserving its existing window and viewport state.
    async fn attach(&self, endpoint: &str) -> Result<Arc<dyn BrowserConnection>, DriverError>;
}

/// An established connection to a browser process.
#[async_trait]
pub trait BrowserConnection: Send + Sync {
    /// Open a new blank page.
    async fn new_page(&self) -> Result<PageHandle, DriverError>;

    /// Whether the connection is still believed to be alive. Pure read,
    /// never touches the wire.
    fn is_connected(&self) -> bool;

    /// Close the browser. Safe to call more than once.
    async fn close(&self) -> Result<(), DriverError>;

    /// Subscribe to disconnection and page-close notifications.
    fn events(&self) -> broadcast::Receiver<BrowserEvent>;
}

/// The page-like capability action handlers operate on.
///
/// Implementations for nested browsing contexts (frames) may reject
/// page-level operations such as navigation or screenshots with
/// [`DriverError::Unsupported`].
#[async_trait]
pub trait PageDriver: Send + Sync {
    fn id(&self) -> &PageId;

    /// Navigate to `url`, waiting for network quiescence or the deadline.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    async fn title(&self) -> Result<String, DriverError>;

    /// Serialized HTML of the current document.
    async fn content(&self) -> Result<String, DriverError>;

    /// Evaluate a script in the page's execution context and return its
    /// result. Exceptions raised by the script surface as
    /// [`DriverError::ScriptException`].
    async fn evaluate(&self, expression: &str) -> Result<JsonValue, DriverError>;

    /// Capture the viewport (or the full document) as an encoded image.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError>;

    /// Cookies visible to the current page, as a JSON array.
    async fn cookies(&self) -> Result<JsonValue, DriverError>;

    async fn back(&self) -> Result<(), DriverError>;

    async fn forward(&self) -> Result<(), DriverError>;

    async fn reload(&self) -> Result<(), DriverError>;

    /// Wait for the next navigation to finish. Returns `false` when the
    /// deadline elapsed without one.
    async fn wait_for_navigation(&self, timeout: Duration) -> Result<bool, DriverError>;

    /// Resolve `frame_selector` to a nested browsing context and return a
    /// capability scoped to it. Fails with [`DriverError::FrameResolution`]
    /// when the element is absent or exposes no accessible content document.
    async fn frame(&self, frame_selector: &str) -> Result<PageHandle, DriverError>;

    fn is_closed(&self) -> bool;

    /// Close the page. Safe to call on an already-closed page.
    async fn close(&self) -> Result<(), DriverError>;
}
