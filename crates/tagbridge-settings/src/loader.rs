//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `TAGBRIDGE_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BrokerKind, GatewaySettings};

/// Env var naming the settings file when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "TAGBRIDGE_CONFIG";

/// Load settings from `path`, or from `$TAGBRIDGE_CONFIG`, or defaults only.
pub fn load_settings(path: Option<&Path>) -> Result<GatewaySettings> {
    let from_env = read_env_string(CONFIG_PATH_ENV).map(PathBuf::from);
    match path.map(Path::to_path_buf).or(from_env) {
        Some(p) => load_settings_from_path(&p),
        None => {
            let mut settings = GatewaySettings::default();
            apply_overrides(&mut settings, |k| std::env::var(k).ok());
            settings.validate()?;
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus overrides). If the
/// file contains invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = merge_file(path)?;
    apply_overrides(&mut settings, |k| std::env::var(k).ok());
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TAGBRIDGE_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_overrides(settings: &mut GatewaySettings, lookup: impl Fn(&str) -> Option<String>) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_parsed(&lookup, "TAGBRIDGE_PORT", |v| parse_u16_range(v, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_ENDPOINT") {
        settings.server.endpoint = v;
    }
    if let Some(v) = read_parsed(&lookup, "TAGBRIDGE_SEND_QUEUE", |v| {
        parse_usize_range(v, 1, 65536)
    }) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = read_parsed(&lookup, "TAGBRIDGE_VALIDATE_ACTIONS", parse_bool) {
        settings.server.validate_actions = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = read_parsed(&lookup, "TAGBRIDGE_BROKER", BrokerKind::parse) {
        settings.broker.kind = v;
    }
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_BROKER_URL") {
        settings.broker.url = v;
    }
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_BROKER_USERNAME") {
        settings.broker.username = v;
    }
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_BROKER_PASSWORD") {
        settings.broker.password = v;
    }
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_BROKER_CLIENT_NAME") {
        settings.broker.client_name = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_string(&lookup, "TAGBRIDGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_parsed(&lookup, "TAGBRIDGE_LOG_DEBUG", parse_bool) {
        settings.logging.debug = v;
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::errors::SettingsError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 3001, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_skips_null() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_replaces_arrays() {
        let merged = deep_merge(serde_json::json!({"a": [1, 2]}), serde_json::json!({"a": [3]}));
        assert_eq!(merged["a"], serde_json::json!([3]));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server":{{"port":4000,"endpoint":"/devices"}},"logging":{{"debug":true}}}}"#
        )
        .unwrap();
        let s = merge_file(file.path()).unwrap();
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.server.endpoint, "/devices");
        assert_eq!(s.server.host, "0.0.0.0");
        assert!(s.logging.debug);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = merge_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(s.server.port, 3001);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(merge_file(file.path()), Err(SettingsError::Json(_))));
    }

    #[test]
    fn unreadable_path_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        match merge_file(dir.path()) {
            Err(SettingsError::Read { path, .. }) => assert_eq!(path, dir.path()),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = GatewaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("TAGBRIDGE_HOST", "127.0.0.1"),
                ("TAGBRIDGE_PORT", "8088"),
                ("TAGBRIDGE_ENDPOINT", "/gw"),
                ("TAGBRIDGE_SEND_QUEUE", "16"),
                ("TAGBRIDGE_VALIDATE_ACTIONS", "yes"),
                ("TAGBRIDGE_BROKER", "redis"),
                ("TAGBRIDGE_BROKER_URL", "redis://localhost"),
                ("TAGBRIDGE_BROKER_PASSWORD", "secret"),
                ("TAGBRIDGE_LOG_DEBUG", "1"),
            ]),
        );
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 8088);
        assert_eq!(s.server.endpoint, "/gw");
        assert_eq!(s.server.send_queue_capacity, 16);
        assert!(s.server.validate_actions);
        assert_eq!(s.broker.kind, BrokerKind::Redis);
        assert_eq!(s.broker.url, "redis://localhost");
        assert_eq!(s.broker.password, "secret");
        assert!(s.logging.debug);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = GatewaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("TAGBRIDGE_PORT", "0"),
                ("TAGBRIDGE_SEND_QUEUE", "lots"),
                ("TAGBRIDGE_BROKER", "nats"),
                ("TAGBRIDGE_LOG_DEBUG", "maybe"),
                ("TAGBRIDGE_HOST", ""),
            ]),
        );
        assert_eq!(s.server.port, 3001);
        assert_eq!(s.server.send_queue_capacity, 256);
        assert_eq!(s.broker.kind, BrokerKind::Memory);
        assert!(!s.logging.debug);
        assert_eq!(s.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("x"), None);
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_usize_range("70000", 1, 65536), None);
    }
}
