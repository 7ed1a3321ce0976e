//! # tagbridge-queue
//!
//! The broker side of the gateway.
//!
//! - [`MessageQueue`]: subscribe / unsubscribe / publish / shutdown by topic
//! - [`MessageHandler`]: callback the broker invokes, on its own tasks, for
//!   every delivered message
//! - [`memory::InMemoryQueue`]: in-process bus
//! - `redis_pubsub::RedisQueue` (feature `redis`): Redis pub/sub adapter
//! - `testing::RecordingQueue` (feature `testing`): call-counting double

#![deny(unsafe_code)]

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_pubsub;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryQueue;

/// Result returned by a [`MessageHandler`].
///
/// `Ok` tells the broker the message is done with, including messages the
/// handler chose to ignore. `Err` is reserved for conditions the broker's own
/// retry policy should act on.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Errors reported by a [`MessageQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// `shutdown_all` has already been called.
    #[error("queue has been shut down")]
    Closed,
    /// The broker could not be reached.
    #[error("broker connection failed: {0}")]
    Connection(String),
    /// `unsubscribe` was called for a topic with no subscription.
    #[error("not subscribed to topic '{0}'")]
    NotSubscribed(String),
    /// Any other broker-side failure.
    #[error("broker error: {0}")]
    Backend(String),
}

/// Callback invoked by the broker for each delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message delivered on `topic`.
    async fn handle(&self, topic: &str, payload: &str) -> HandlerResult;
}

/// Topic-addressed publish/subscribe broker.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Start delivering messages on `topic` to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError>;

    /// Stop delivering messages on `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), QueueError>;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError>;

    /// Tear down every subscription. Terminal.
    async fn shutdown_all(&self);
}
