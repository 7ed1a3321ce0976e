//! # tagbridge-core
//!
//! Shared vocabulary of the tagbridge gateway.
//!
//! - [`ids`]: `DeviceTag` and `ConnectionId` newtypes
//! - [`topics`]: the `edge.msg.<tag>` / `cloud.msg.<tag>` naming contract
//! - [`envelope`]: the `{code, message}` response sent to clients
//! - [`validation`]: the minimal action-message check

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;
pub mod topics;
pub mod validation;

pub use envelope::ResponseEnvelope;
pub use ids::{ConnectionId, DeviceTag, TagError};
pub use topics::{TopicError, device_tag_from_topic, event_topic, publish_topic};
pub use validation::{ActionMessage, BasicActionMessage, ValidationError, validate_action_message};
