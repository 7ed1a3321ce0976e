//! Call-recording [`MessageQueue`] double for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{HandlerResult, MessageHandler, MessageQueue, QueueError};

/// Records every call and lets tests inject failures and deliveries.
#[derive(Default)]
pub struct RecordingQueue {
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    published: Mutex<Vec<(String, String)>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    fail_publish: AtomicBool,
}

impl RecordingQueue {
    /// Create a queue where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `subscribe` calls fail (or succeed again).
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `unsubscribe` calls fail (or succeed again).
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `publish` calls fail (or succeed again).
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of `subscribe` calls, failed ones included.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `unsubscribe` calls, failed ones included.
    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `publish` calls, failed ones included.
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Number of `shutdown_all` calls.
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Successfully published `(topic, payload)` pairs, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Whether `topic` has an active subscription.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.handlers.lock().contains_key(topic)
    }

    /// Topics with an active subscription, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver a message as the broker would. Returns `None` when nothing is
    /// subscribed to `topic`.
    pub async fn deliver(&self, topic: &str, payload: &str) -> Option<HandlerResult> {
        let handler = self.handlers.lock().get(topic).cloned()?;
        Some(handler.handle(topic, payload).await)
    }
}

#[async_trait]
impl MessageQueue for RecordingQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let _ = self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(format!("subscribe to '{topic}' refused")));
        }
        let _ = self.handlers.lock().insert(topic.to_owned(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), QueueError> {
        let _ = self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(format!("unsubscribe from '{topic}' refused")));
        }
        match self.handlers.lock().remove(topic) {
            Some(_) => Ok(()),
            None => Err(QueueError::NotSubscribed(topic.to_owned())),
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError> {
        let _ = self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(format!("publish to '{topic}' refused")));
        }
        self.published
            .lock()
            .push((topic.to_owned(), payload.to_owned()));
        Ok(())
    }

    async fn shutdown_all(&self) {
        let _ = self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().clear();
    }
}
