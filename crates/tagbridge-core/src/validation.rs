//! Action-message validation.
//!
//! The gateway treats client payloads as opaque. The only check it knows how
//! to make is that a payload is a JSON object with a non-empty `action`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a payload failed the action-message check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload is not a JSON object with a string `action`.
    #[error("error when validating action message: {0}")]
    InvalidJson(String),
    /// `action` is present but empty.
    #[error("field action of action message can not be empty")]
    EmptyAction,
}

/// Minimal action message. Unknown fields pass through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    /// Name of the action; must be non-empty.
    #[serde(default)]
    pub action: String,
}

/// Action message with the optional bookkeeping fields clients commonly
/// attach.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicActionMessage {
    /// Name of the action.
    pub action: String,
    /// Client timestamp (unix millis).
    #[serde(default)]
    pub timestamp: i64,
    /// Client-side message id.
    #[serde(default)]
    pub id: String,
}

/// Check that `raw` is an action message with a non-empty `action`.
pub fn validate_action_message(raw: &str) -> Result<ActionMessage, ValidationError> {
    let msg: ActionMessage =
        serde_json::from_str(raw).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    if msg.action.is_empty() {
        return Err(ValidationError::EmptyAction);
    }
    Ok(msg)
}
