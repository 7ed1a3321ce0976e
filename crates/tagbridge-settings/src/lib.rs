//! # tagbridge-settings
//!
//! Gateway configuration, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `TAGBRIDGE_*` overrides (highest priority)
//!
//! Settings are a plain value handed to constructors; nothing here is global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{CONFIG_PATH_ENV, deep_merge, load_settings, load_settings_from_path};
pub use types::{BrokerKind, BrokerSettings, GatewaySettings, LoggingSettings, ServerSettings};
