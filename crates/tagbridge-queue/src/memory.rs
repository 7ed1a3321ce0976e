//! In-process topic bus.
//!
//! Each topic has at most one handler. `publish` hands the payload to that
//! handler on a freshly spawned task, so delivery never runs on the
//! publisher's task. There is no redelivery: a handler error is logged and
//! the message is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{MessageHandler, MessageQueue, QueueError};

/// Broker living inside the gateway process.
pub struct InMemoryQueue {
    subscriptions: DashMap<String, Arc<dyn MessageHandler>>,
    closed: AtomicBool,
}

impl InMemoryQueue {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `topic` currently has a handler.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// Number of subscribed topics.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        if self.subscriptions.insert(topic.to_owned(), handler).is_some() {
            debug!(topic, "replaced existing subscription");
        }
        debug!(topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        match self.subscriptions.remove(topic) {
            Some(_) => {
                debug!(topic, "unsubscribed");
                Ok(())
            }
            None => Err(QueueError::NotSubscribed(topic.to_owned())),
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        let handler = self.subscriptions.get(topic).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            debug!(topic, "no subscriber, message dropped");
            return Ok(());
        };
        let topic = topic.to_owned();
        let payload = payload.to_owned();
        drop(tokio::spawn(async move {
            if let Err(e) = handler.handle(&topic, &payload).await {
                warn!(topic = %topic, error = %e, "handler rejected message");
            }
        }));
        Ok(())
    }

    async fn shutdown_all(&self) {
        self.closed.store(true, Ordering::Release);
        let topics = self.subscriptions.len();
        self.subscriptions.clear();
        debug!(topics, "in-memory queue shut down");
    }
}
