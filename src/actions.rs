//! Action registry and dispatch engine.
//!
//! Actions are a closed enumeration ([`ActionKind`]): every supported
//! operation has exactly one variant and one handler, all polymorphic over
//! the [`PageDriver`] capability. The [`Dispatcher`] looks up the handler,
//! invokes it, and folds any failure into a failure envelope. Dispatch is
//! total over its inputs and never raises, unregistered action names
//! included.
//!
//! Element interaction is expressed as generated DOM scripts (see
//! [`scripts`]) which report an explicit `{found: bool, ...}` result, so
//! mutating handlers can fail with an element-not-found error while
//! query-style handlers (`getText`, `getAttribute`, `isVisible`)
//! deliberately downgrade an absent element to a benign default.

use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::config::DEFAULT_TIMEOUT_MS;
use crate::driver::{DriverError, PageDriver};
use crate::envelope::{ActionEnvelope, JsonObject};

mod frames;
pub(crate) mod scripts;

/// Default scroll distance in pixels.
const DEFAULT_SCROLL_PIXELS: i64 = 300;

/// Interval between condition re-checks while waiting.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failures produced by action handlers, folded into failure envelopes at
/// the dispatch boundary.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("missing required parameter '{param}' for action '{action}'")]
    MissingParam {
        action: &'static str,
        param: &'static str,
    },
    #[error("invalid value for parameter '{param}' of action '{action}'")]
    InvalidParam {
        action: &'static str,
        param: &'static str,
    },
    #[error("no element matches selector '{0}'")]
    ElementNotFound(String),
    #[error("timed out after {timeout_ms}ms waiting for {condition}")]
    Timeout { condition: String, timeout_ms: u64 },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("failed to encode script argument: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The closed set of supported actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Navigate,
    GetHtml,
    GetTitle,
    GetUrl,
    Screenshot,
    Click,
    Hover,
    DoubleClick,
    Type,
    Scroll,
    Evaluate,
    WaitForSelector,
    WaitForFunction,
    WaitForNavigation,
    GetText,
    GetAttribute,
    IsVisible,
    SelectOption,
    Back,
    Forward,
    Refresh,
    GetCookies,
    FrameClick,
    FrameType,
    FrameEvaluate,
    FrameGetHtml,
    WaitForFrame,
}

impl ActionKind {
    /// Every registered action, in registry order.
    pub const ALL: &'static [ActionKind] = &[
        ActionKind::Navigate,
        ActionKind::GetHtml,
        ActionKind::GetTitle,
        ActionKind::GetUrl,
        ActionKind::Screenshot,
        ActionKind::Click,
        ActionKind::Hover,
        ActionKind::DoubleClick,
        ActionKind::Type,
        ActionKind::Scroll,
        ActionKind::Evaluate,
        ActionKind::WaitForSelector,
        ActionKind::WaitForFunction,
        ActionKind::WaitForNavigation,
        ActionKind::GetText,
        ActionKind::GetAttribute,
        ActionKind::IsVisible,
        ActionKind::SelectOption,
        ActionKind::Back,
        ActionKind::Forward,
        ActionKind::Refresh,
        ActionKind::GetCookies,
        ActionKind::FrameClick,
        ActionKind::FrameType,
        ActionKind::FrameEvaluate,
        ActionKind::FrameGetHtml,
        ActionKind::WaitForFrame,
    ];

    /// Resolve a wire-level action name to its variant.
    pub fn parse(name: &str) -> Option<Self> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
    }

    /// The wire-level name of this action.
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::GetHtml => "getHtml",
            ActionKind::GetTitle => "getTitle",
            ActionKind::GetUrl => "getUrl",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Click => "click",
            ActionKind::Hover => "hover",
            ActionKind::DoubleClick => "doubleClick",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Evaluate => "evaluate",
            ActionKind::WaitForSelector => "waitForSelector",
            ActionKind::WaitForFunction => "waitForFunction",
            ActionKind::WaitForNavigation => "waitForNavigation",
            ActionKind::GetText => "getText",
            ActionKind::GetAttribute => "getAttribute",
            ActionKind::IsVisible => "isVisible",
            ActionKind::SelectOption => "selectOption",
            ActionKind::Back => "back",
            ActionKind::Forward => "forward",
            ActionKind::Refresh => "refresh",
            ActionKind::GetCookies => "getCookies",
            ActionKind::FrameClick => "frameClick",
            ActionKind::FrameType => "frameType",
            ActionKind::FrameEvaluate => "frameEvaluate",
            ActionKind::FrameGetHtml => "frameGetHtml",
            ActionKind::WaitForFrame => "waitForFrame",
        }
    }
}

/// Dispatch engine: resolves the handler for a named action, runs it, and
/// encodes the outcome as an [`ActionEnvelope`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    default_timeout_ms: u64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new(DEFAULT_TIMEOUT_MS)
    }
}

impl Dispatcher {
    pub fn new(default_timeout_ms: u64) -> Self {
        Dispatcher { default_timeout_ms }
    }

    /// Execute a named action against a page. Never raises: every outcome,
    /// including an unknown action name, becomes exactly one envelope.
    pub async fn execute(
        &self,
        name: &str,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> ActionEnvelope {
        let Some(kind) = ActionKind::parse(name) else {
            return ActionEnvelope::failure(name, ActionError::UnknownAction(name.to_string()));
        };

        match self.run(kind, page, params).await {
            Ok(data) => ActionEnvelope::success(kind.name(), data),
            Err(err) => ActionEnvelope::failure(kind.name(), err),
        }
    }

    async fn run(
        &self,
        kind: ActionKind,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        match kind {
            ActionKind::Navigate => self.navigate(page, params).await,
            ActionKind::GetHtml => get_html(page).await,
            ActionKind::GetTitle => get_title(page).await,
            ActionKind::GetUrl => get_url(page).await,
            ActionKind::Screenshot => screenshot(page, params).await,
            ActionKind::Click => click(page, params).await,
            ActionKind::Hover => hover(page, params).await,
            ActionKind::DoubleClick => double_click(page, params).await,
            ActionKind::Type => type_text(page, params).await,
            ActionKind::Scroll => scroll(page, params).await,
            ActionKind::Evaluate => evaluate(page, params).await,
            ActionKind::WaitForSelector => self.wait_for_selector(page, params).await,
            ActionKind::WaitForFunction => self.wait_for_function(page, params).await,
            ActionKind::WaitForNavigation => self.wait_for_navigation(page, params).await,
            ActionKind::GetText => get_text(page, params).await,
            ActionKind::GetAttribute => get_attribute(page, params).await,
            ActionKind::IsVisible => is_visible(page, params).await,
            ActionKind::SelectOption => select_option(page, params).await,
            ActionKind::Back => back(page).await,
            ActionKind::Forward => forward(page).await,
            ActionKind::Refresh => refresh(page).await,
            ActionKind::GetCookies => get_cookies(page).await,
            ActionKind::FrameClick => frames::frame_click(page, params).await,
            ActionKind::FrameType => frames::frame_type(page, params).await,
            ActionKind::FrameEvaluate => frames::frame_evaluate(page, params).await,
            ActionKind::FrameGetHtml => frames::frame_get_html(page, params).await,
            ActionKind::WaitForFrame => self.wait_for_frame(page, params).await,
        }
    }

    async fn navigate(
        &self,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        let url = require_str(params, "navigate", "url")?;
        Url::parse(url).map_err(|err| ActionError::Navigation(format!("invalid url '{url}': {err}")))?;

        page.goto(url, Duration::from_millis(self.default_timeout_ms))
            .await
            .map_err(navigation_error)?;

        Ok(payload(json!({
            "url": page.current_url().await?,
            "title": page.title().await?,
        })))
    }

    async fn wait_for_selector(
        &self,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        let selector = require_str(params, "waitForSelector", "selector")?;
        let timeout_ms = optional_u64(params, "waitForSelector", "timeout")?
            .unwrap_or(self.default_timeout_ms);

        let script = scripts::selector_exists_script(selector)?;
        poll_until_true(page, &script, format!("selector '{selector}'"), timeout_ms).await?;

        Ok(payload(json!({ "selector": selector })))
    }

    async fn wait_for_function(
        &self,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        let script = require_str(params, "waitForFunction", "script")?;
        let timeout_ms = optional_u64(params, "waitForFunction", "timeout")?
            .unwrap_or(self.default_timeout_ms);

        let probe = scripts::function_probe_script(script)?;
        poll_until_true(page, &probe, "function to become truthy".to_string(), timeout_ms).await?;

        Ok(payload(json!({ "script": script })))
    }

    async fn wait_for_navigation(
        &self,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        let timeout_ms = optional_u64(params, "waitForNavigation", "timeout")?
            .unwrap_or(self.default_timeout_ms);

        let navigated = page
            .wait_for_navigation(Duration::from_millis(timeout_ms))
            .await?;
        if !navigated {
            return Err(ActionError::Timeout {
                condition: "navigation".to_string(),
                timeout_ms,
            });
        }

        Ok(payload(json!({ "url": page.current_url().await? })))
    }

    async fn wait_for_frame(
        &self,
        page: &dyn PageDriver,
        params: &JsonObject,
    ) -> Result<JsonObject, ActionError> {
        let frame_selector = require_str(params, "waitForFrame", "frameSelector")?;
        let timeout_ms =
            optional_u64(params, "waitForFrame", "timeout")?.unwrap_or(self.default_timeout_ms);

        frames::wait_for_frame(page, frame_selector, timeout_ms).await?;

        Ok(payload(json!({ "frameSelector": frame_selector })))
    }
}

/// Execute a named action with the stock 30s operation timeout.
pub async fn execute_action(
    name: &str,
    page: &dyn PageDriver,
    params: &JsonObject,
) -> ActionEnvelope {
    Dispatcher::default().execute(name, page, params).await
}

// ── Simple page-level handlers ──────────────────────────────────────────

async fn get_html(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    Ok(payload(json!({ "html": page.content().await? })))
}

async fn get_title(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    Ok(payload(json!({ "title": page.title().await? })))
}

async fn get_url(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    Ok(payload(json!({ "url": page.current_url().await? })))
}

async fn screenshot(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let full_page = optional_bool(params, "screenshot", "fullPage")?.unwrap_or(false);
    let bytes = page.screenshot(full_page).await?;
    Ok(payload(json!({ "image": STANDARD.encode(bytes) })))
}

async fn evaluate(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let script = require_str(params, "evaluate", "script")?;
    let result = page.evaluate(script).await?;
    Ok(payload(json!({ "result": result })))
}

async fn scroll(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let pixels = optional_i64(params, "scroll", "pixels")?.unwrap_or(DEFAULT_SCROLL_PIXELS);
    page.evaluate(&scripts::scroll_script(pixels)).await?;
    Ok(payload(json!({ "pixels": pixels })))
}

async fn back(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    page.back().await?;
    Ok(payload(json!({ "url": page.current_url().await? })))
}

async fn forward(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    page.forward().await?;
    Ok(payload(json!({ "url": page.current_url().await? })))
}

async fn refresh(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    page.reload().await?;
    Ok(payload(json!({ "url": page.current_url().await? })))
}

async fn get_cookies(page: &dyn PageDriver) -> Result<JsonObject, ActionError> {
    Ok(payload(json!({ "cookies": page.cookies().await? })))
}

// ── Element handlers ────────────────────────────────────────────────────

async fn click(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "click", "selector")?;
    click_element(page, selector).await?;
    Ok(payload(json!({ "selector": selector })))
}

async fn hover(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "hover", "selector")?;
    let script = scripts::hover_script(selector)?;
    require_element(page, &script, selector).await?;
    Ok(payload(json!({ "selector": selector })))
}

async fn double_click(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "doubleClick", "selector")?;
    let script = scripts::double_click_script(selector)?;
    require_element(page, &script, selector).await?;
    Ok(payload(json!({ "selector": selector })))
}

async fn type_text(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "type", "selector")?;
    let text = require_str(params, "type", "text")?;
    type_into_element(page, selector, text).await?;
    Ok(payload(json!({ "selector": selector, "text": text })))
}

async fn select_option(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "selectOption", "selector")?;
    let value = require_str(params, "selectOption", "value")?;
    let script = scripts::select_option_script(selector, value)?;
    require_element(page, &script, selector).await?;
    Ok(payload(json!({ "selector": selector, "value": value })))
}

async fn get_text(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "getText", "selector")?;
    let script = scripts::text_content_script(selector)?;
    // Absent element reads as empty text: this is a check, not a requirement.
    let text = match probe_element(page, &script).await? {
        Some(value) => value.as_str().unwrap_or_default().to_string(),
        None => String::new(),
    };
    Ok(payload(json!({ "text": text })))
}

async fn get_attribute(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "getAttribute", "selector")?;
    let attribute = require_str(params, "getAttribute", "attribute")?;
    let script = scripts::attribute_script(selector, attribute)?;
    let value = probe_element(page, &script)
        .await?
        .unwrap_or(JsonValue::Null);
    Ok(payload(json!({ "value": value })))
}

async fn is_visible(page: &dyn PageDriver, params: &JsonObject) -> Result<JsonObject, ActionError> {
    let selector = require_str(params, "isVisible", "selector")?;
    let script = scripts::visibility_script(selector)?;
    let visible = match probe_element(page, &script).await? {
        Some(value) => value.as_bool().unwrap_or(false),
        None => false,
    };
    Ok(payload(json!({ "visible": visible })))
}

// ── Element plumbing shared with the frame-scoped variants ──────────────

pub(crate) async fn click_element(
    page: &dyn PageDriver,
    selector: &str,
) -> Result<(), ActionError> {
    let script = scripts::click_script(selector)?;
    require_element(page, &script, selector).await
}

pub(crate) async fn type_into_element(
    page: &dyn PageDriver,
    selector: &str,
    text: &str,
) -> Result<(), ActionError> {
    let script = scripts::type_script(selector, text)?;
    require_element(page, &script, selector).await
}

/// Run an element script and fail when no element matched.
async fn require_element(
    page: &dyn PageDriver,
    script: &str,
    selector: &str,
) -> Result<(), ActionError> {
    match probe_element(page, script).await? {
        Some(_) => Ok(()),
        None => Err(ActionError::ElementNotFound(selector.to_string())),
    }
}

/// Run an element script, returning `Some(value)` when the element was
/// found and `None` when it was absent.
async fn probe_element(
    page: &dyn PageDriver,
    script: &str,
) -> Result<Option<JsonValue>, ActionError> {
    let result = page.evaluate(script).await?;
    match result.get("found").and_then(JsonValue::as_bool) {
        Some(true) => Ok(Some(
            result.get("value").cloned().unwrap_or(JsonValue::Null),
        )),
        Some(false) => Ok(None),
        None => Err(ActionError::Driver(DriverError::Message(
            "element probe returned an unexpected shape".to_string(),
        ))),
    }
}

async fn poll_until_true(
    page: &dyn PageDriver,
    script: &str,
    condition: String,
    timeout_ms: u64,
) -> Result<(), ActionError> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let value = page.evaluate(script).await?;
        if value.as_bool().unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ActionError::Timeout {
                condition,
                timeout_ms,
            });
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

fn navigation_error(err: DriverError) -> ActionError {
    match err {
        DriverError::Navigation(message) => ActionError::Navigation(message),
        DriverError::ConnectionLost(_) => ActionError::Driver(err),
        other => ActionError::Navigation(other.to_string()),
    }
}

// ── Parameter helpers ───────────────────────────────────────────────────

fn require_str<'a>(
    params: &'a JsonObject,
    action: &'static str,
    param: &'static str,
) -> Result<&'a str, ActionError> {
    match params.get(param) {
        Some(JsonValue::String(value)) => Ok(value),
        Some(_) => Err(ActionError::InvalidParam { action, param }),
        None => Err(ActionError::MissingParam { action, param }),
    }
}

fn optional_bool(
    params: &JsonObject,
    action: &'static str,
    param: &'static str,
) -> Result<Option<bool>, ActionError> {
    match params.get(param) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(ActionError::InvalidParam { action, param }),
    }
}

fn optional_i64(
    params: &JsonObject,
    action: &'static str,
    param: &'static str,
) -> Result<Option<i64>, ActionError> {
    match params.get(param) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(value)) => value
            .as_i64()
            .map(Some)
            .ok_or(ActionError::InvalidParam { action, param }),
        Some(_) => Err(ActionError::InvalidParam { action, param }),
    }
}

fn optional_u64(
    params: &JsonObject,
    action: &'static str,
    param: &'static str,
) -> Result<Option<u64>, ActionError> {
    match params.get(param) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(value)) => value
            .as_u64()
            .map(Some)
            .ok_or(ActionError::InvalidParam { action, param }),
        Some(_) => Err(ActionError::InvalidParam { action, param }),
    }
}

fn payload(value: JsonValue) -> JsonObject {
    match value {
        JsonValue::Object(map) => map,
        _ => JsonObject::new(),
    }
}
