//! DOM script builders used by the action handlers.
//!
//! Every builder produces a self-contained expression. Element scripts
//! resolve a CSS selector and report `{found: false}` when nothing matches,
//! otherwise `{found: true, value: ...}`; the caller decides whether an
//! absent element is an error or a benign default. Selector, text, and
//! attribute inputs are embedded as JSON string literals so arbitrary user
//! input cannot break out of the script.

use serde_json::Error as JsonError;

fn quote(value: &str) -> Result<String, JsonError> {
    serde_json::to_string(value)
}

/// Wrap `body` in an element lookup for `selector`. The body runs with the
/// matched element bound to `el` and must return the probe object.
fn element_script(selector: &str, body: &str) -> Result<String, JsonError> {
    let sel = quote(selector)?;
    Ok(format!(
        "(function() {{
            const el = document.querySelector({sel});
            if (!el) {{
                return {{ found: false }};
            }}
            {body}
        }})()"
    ))
}

pub(crate) fn click_script(selector: &str) -> Result<String, JsonError> {
    element_script(selector, "el.click(); return { found: true };")
}

pub(crate) fn hover_script(selector: &str) -> Result<String, JsonError> {
    element_script(
        selector,
        "el.dispatchEvent(new MouseEvent('mouseover', { bubbles: true }));
            el.dispatchEvent(new MouseEvent('mouseenter', { bubbles: false }));
            return { found: true };",
    )
}

pub(crate) fn double_click_script(selector: &str) -> Result<String, JsonError> {
    element_script(
        selector,
        "el.dispatchEvent(new MouseEvent('dblclick', { bubbles: true, cancelable: true }));
            return { found: true };",
    )
}

/// Focus the element and emit input events for each character in order.
pub(crate) fn type_script(selector: &str, text: &str) -> Result<String, JsonError> {
    let text_json = quote(text)?;
    let body = format!(
        "el.focus();
            const text = {text_json};
            for (const ch of text) {{
                el.dispatchEvent(new KeyboardEvent('keydown', {{ key: ch, bubbles: true }}));
                if ('value' in el) {{
                    el.value += ch;
                }}
                el.dispatchEvent(new InputEvent('input', {{ data: ch, bubbles: true }}));
                el.dispatchEvent(new KeyboardEvent('keyup', {{ key: ch, bubbles: true }}));
            }}
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return {{ found: true }};"
    );
    element_script(selector, &body)
}

pub(crate) fn select_option_script(selector: &str, value: &str) -> Result<String, JsonError> {
    let value_json = quote(value)?;
    let body = format!(
        "const desired = {value_json};
            const options = Array.from(el.options || []);
            const match = options.find(opt => opt.value === desired || opt.text === desired);
            if (match) {{
                el.value = match.value;
            }}
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return {{ found: true, value: el.value }};"
    );
    element_script(selector, &body)
}

pub(crate) fn text_content_script(selector: &str) -> Result<String, JsonError> {
    element_script(
        selector,
        "return { found: true, value: el.textContent || '' };",
    )
}

pub(crate) fn attribute_script(selector: &str, attribute: &str) -> Result<String, JsonError> {
    let attr = quote(attribute)?;
    let body = format!("return {{ found: true, value: el.getAttribute({attr}) }};");
    element_script(selector, &body)
}

pub(crate) fn visibility_script(selector: &str) -> Result<String, JsonError> {
    element_script(
        selector,
        "const style = window.getComputedStyle(el);
            const rect = el.getBoundingClientRect();
            const visible = style.display !== 'none'
                && style.visibility !== 'hidden'
                && rect.width > 0
                && rect.height > 0;
            return { found: true, value: visible };",
    )
}

pub(crate) fn scroll_script(pixels: i64) -> String {
    format!("window.scrollBy(0, {pixels}); true")
}

pub(crate) fn selector_exists_script(selector: &str) -> Result<String, JsonError> {
    let sel = quote(selector)?;
    Ok(format!("document.querySelector({sel}) !== null"))
}

/// Truthiness probe for `waitForFunction`: exceptions raised while the page
/// is still settling read as "not yet".
pub(crate) fn function_probe_script(script: &str) -> Result<String, JsonError> {
    let script_json = quote(script)?;
    Ok(format!(
        "(function() {{
            try {{
                return !!window.eval({script_json});
            }} catch (err) {{
                return false;
            }}
        }})()"
    ))
}
