//! Frame-scoped action variants.
//!
//! These handlers first resolve `frameSelector` to a nested browsing
//! context. If the element is absent, or present but exposes no accessible
//! content document (cross-origin restriction or not yet loaded), the
//! action fails with a frame-resolution error naming the selector before
//! the sub-operation is attempted. The sub-operation then runs against the
//! frame-scoped capability with the same contracts as the top-level
//! handlers.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use super::{
    ActionError, WAIT_POLL_INTERVAL, click_element, payload, require_str, type_into_element,
};
use crate::driver::{DriverError, PageDriver, PageHandle};
use crate::envelope::JsonObject;

async fn resolve_frame(
    page: &dyn PageDriver,
    frame_selector: &str,
) -> Result<PageHandle, ActionError> {
    page.frame(frame_selector).await.map_err(ActionError::from)
}

pub(super) async fn frame_click(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let frame_selector = require_str(params, "frameClick", "frameSelector")?;
    let selector = require_str(params, "frameClick", "selector")?;

    let frame = resolve_frame(page, frame_selector).await?;
    click_element(frame.as_ref(), selector).await?;

    Ok(payload(json!({
        "frameSelector": frame_selector,
        "selector": selector,
    })))
}

pub(super) async fn frame_type(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let frame_selector = require_str(params, "frameType", "frameSelector")?;
    let selector = require_str(params, "frameType", "selector")?;
    let text = require_str(params, "frameType", "text")?;

    let frame = resolve_frame(page, frame_selector).await?;
    type_into_element(frame.as_ref(), selector, text).await?;

    Ok(payload(json!({
        "frameSelector": frame_selector,
        "selector": selector,
        "text": text,
    })))
}

pub(super) async fn frame_evaluate(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let frame_selector = require_str(params, "frameEvaluate", "frameSelector")?;
    let script = require_str(params, "frameEvaluate", "script")?;

    let frame = resolve_frame(page, frame_selector).await?;
    let result = frame.evaluate(script).await?;

    Ok(payload(json!({ "result": result })))
}

pub(super) async fn frame_get_html(
    page: &dyn PageDriver,
    params: &JsonObject,
) -> Result<JsonObject, ActionError> {
    let frame_selector = require_str(params, "frameGetHtml", "frameSelector")?;

    let frame = resolve_frame(page, frame_selector).await?;
    let html = frame.content().await?;

    Ok(payload(json!({ "html": html })))
}

/// Poll frame resolution until the nested context becomes accessible or the
/// deadline elapses. Driver failures other than frame resolution abort the
/// wait immediately.
pub(super) async fn wait_for_frame(
    page: &dyn PageDriver,
    frame_selector: &str,
    timeout_ms: u64,
) -> Result<(), ActionError> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match page.frame(frame_selector).await {
            Ok(_) => return Ok(()),
            Err(DriverError::FrameResolution(_)) => {}
            Err(other) => return Err(ActionError::from(other)),
        }
        if Instant::now() >= deadline {
            return Err(ActionError::Timeout {
                condition: format!("frame '{frame_selector}'"),
                timeout_ms,
            });
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}
