//! Settings types.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Message broker connection.
    pub broker: BrokerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject combinations the gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !self.server.endpoint.starts_with('/') {
            return Err(SettingsError::InvalidValue {
                key: "server.endpoint",
                reason: format!("must start with '/': {}", self.server.endpoint),
            });
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue {
                key: "server.sendQueueCapacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.broker.kind == BrokerKind::Redis && self.broker.url.is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "broker.url",
                reason: "required when broker.kind is redis".into(),
            });
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub endpoint: String,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Require every client frame to be an action message.
    pub validate_actions: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            endpoint: "/deviceproxy".to_string(),
            send_queue_capacity: 256,
            validate_actions: false,
        }
    }
}

/// Which broker implementation to connect to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process bus (single gateway, no external broker).
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis,
}

impl BrokerKind {
    /// Parse a broker kind name, case-insensitively.
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Broker connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Broker implementation.
    pub kind: BrokerKind,
    /// Broker URL (required for `redis`).
    pub url: String,
    /// Optional username.
    pub username: String,
    /// Optional password.
    #[serde(skip_serializing)]
    pub password: String,
    /// Name this gateway identifies itself with on the broker.
    pub client_name: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            url: String::new(),
            username: String::new(),
            password: String::new(),
            client_name: "tagbridge".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter level when `RUST_LOG` is unset.
    pub level: String,
    /// Log message payloads (forces `debug` level).
    pub debug: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

impl LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> &str {
        if self.debug { "debug" } else { &self.level }
    }
}
