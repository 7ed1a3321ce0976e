//! Identifier newtypes.
//!
//! A [`DeviceTag`] names a logical device and is always non-empty. A
//! [`ConnectionId`] names one live socket and is a UUID v7 generated on
//! accept.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while extracting a device tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// The tag was absent or empty.
    #[error("URL Param 'deviceTag' is missing")]
    Missing,
}

/// Opaque identifier of a logical device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceTag(String);

impl DeviceTag {
    /// Build a tag from a raw value. Empty strings are rejected.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TagError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TagError::Missing);
        }
        Ok(Self(raw))
    }

    /// Build a tag from an optional raw query value.
    pub fn from_query(raw: Option<&str>) -> Result<Self, TagError> {
        raw.ok_or(TagError::Missing).and_then(Self::parse)
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceTag {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DeviceTag> for String {
    fn from(tag: DeviceTag) -> Self {
        tag.0
    }
}

impl AsRef<str> for DeviceTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identifier of one client socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
