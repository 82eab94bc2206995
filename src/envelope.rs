//! The uniform wire shape returned for every action.
//!
//! Every dispatched action, regardless of outcome, produces exactly one
//! [`ActionEnvelope`]. The invariant `success == error.is_none()` is
//! enforced by construction: the only ways to build an envelope are the
//! [`ActionEnvelope::success`] and [`ActionEnvelope::failure`] constructors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub type JsonObject = JsonMap<String, JsonValue>;

/// Result/error envelope for a single action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub success: bool,
    pub action: String,
    pub data: JsonObject,
    pub error: Option<String>,
}

impl ActionEnvelope {
    /// Wrap a handler's result payload in a success envelope.
    pub fn success(action: impl Into<String>, data: JsonObject) -> Self {
        ActionEnvelope {
            success: true,
            action: action.into(),
            data,
            error: None,
        }
    }

    /// Fold a failure into an envelope carrying its human-readable message.
    pub fn failure(action: impl Into<String>, error: impl fmt::Display) -> Self {
        ActionEnvelope {
            success: false,
            action: action.into(),
            data: JsonObject::new(),
            error: Some(error.to_string()),
        }
    }
}
