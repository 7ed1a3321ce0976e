//! Topic naming shared with every other producer and consumer on the bus.
//!
//! Topics are pure functions of the device tag:
//!
//! | Direction | Topic |
//! |-----------|-------|
//! | bus → gateway → clients | `edge.msg.<tag>` |
//! | clients → gateway → bus | `cloud.msg.<tag>` |

use thiserror::Error;

use crate::ids::DeviceTag;

/// Prefix of topics carrying messages toward device clients.
pub const EVENT_TOPIC_PREFIX: &str = "edge.msg.";

/// Prefix of topics carrying messages from device clients.
pub const PUBLISH_TOPIC_PREFIX: &str = "cloud.msg.";

/// Literal separator between the topic kind and the device tag.
pub const TOPIC_SEPARATOR: &str = ".msg.";

/// A topic string that does not follow the naming convention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// The separator `.msg.` does not occur in the topic.
    #[error("topic '{topic}' does not contain separator '.msg.'")]
    MissingSeparator {
        /// The offending topic.
        topic: String,
    },
    /// Nothing follows the separator.
    #[error("topic '{topic}' carries an empty device tag")]
    EmptyTag {
        /// The offending topic.
        topic: String,
    },
}

/// Topic the gateway subscribes to for `tag`.
pub fn event_topic(tag: &DeviceTag) -> String {
    format!("{EVENT_TOPIC_PREFIX}{tag}")
}

/// Topic the gateway publishes client traffic for `tag` on.
pub fn publish_topic(tag: &DeviceTag) -> String {
    format!("{PUBLISH_TOPIC_PREFIX}{tag}")
}

/// Recover the device tag from a broker topic.
///
/// Everything after the first `.msg.` is the tag, so tags that themselves
/// contain `.msg.` survive the round trip.
pub fn device_tag_from_topic(topic: &str) -> Result<DeviceTag, TopicError> {
    let (_, tag) = topic
        .split_once(TOPIC_SEPARATOR)
        .ok_or_else(|| TopicError::MissingSeparator {
            topic: topic.to_owned(),
        })?;
    DeviceTag::parse(tag).map_err(|_| TopicError::EmptyTag {
        topic: topic.to_owned(),
    })
}
