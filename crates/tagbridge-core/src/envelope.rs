//! The `{code, message}` envelope, the only message format the gateway
//! itself sends to clients.

use serde::{Deserialize, Serialize};

/// Envelope code for success and informational responses.
pub const CODE_SUCCESS: i32 = 0;

/// Envelope code for errors.
pub const CODE_ERROR: i32 = -1;

/// Sent after a connection has been accepted.
pub const MSG_CONNECTION_ESTABLISHED: &str = "Connection established";

/// Sent after a client message was handed to the bus.
pub const MSG_MESSAGE_SENT: &str = "Message successfully sent to platform";

/// Sent when a client sends a binary frame.
pub const MSG_TEXT_ONLY: &str = "Incorrect type of message. Client can send only text messages";

/// Response sent to a client socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// `0` for success/info, `-1` for errors.
    pub code: i32,
    /// Human-readable detail.
    pub message: String,
}

impl ResponseEnvelope {
    /// A success envelope.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: message.into(),
        }
    }

    /// An error envelope.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            message: message.into(),
        }
    }

    /// Whether this envelope reports success.
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"message":""}}"#, self.code)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_wire_form() {
        let env = ResponseEnvelope::success(MSG_CONNECTION_ESTABLISHED);
        let parsed: serde_json::Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(parsed["code"], 0);
        assert_eq!(parsed["message"], "Connection established");
        assert!(env.is_success());
    }

    #[test]
    fn error_wire_form() {
        let env = ResponseEnvelope::error("URL Param 'deviceTag' is missing");
        assert_eq!(
            env.to_json(),
            r#"{"code":-1,"message":"URL Param 'deviceTag' is missing"}"#
        );
        assert!(!env.is_success());
    }

    #[test]
    fn message_is_escaped() {
        let env = ResponseEnvelope::error("bad \"quote\"");
        let back: ResponseEnvelope = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(back, env);
    }
}
