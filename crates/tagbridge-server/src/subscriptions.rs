//! Reference-counted broker subscriptions and message routing.
//!
//! Two locks, never held together:
//!
//! - `holders` maps each subscribed event topic to the connections holding a
//!   reference on it. Connect and disconnect hold it for writing across the
//!   broker call, so a tag never sees two concurrent subscribes or a
//!   subscribe racing an unsubscribe.
//! - `publish_lock` serializes client publishes. Publishing checks the
//!   holders first (briefly, read-only) and releases them before taking
//!   this lock, so a slow broker publish never stalls connect/disconnect.
//!
//! The cost is a known race: the last connection for a tag can disconnect
//! between the check and the publish, in which case the message still goes
//! out for a tag nobody is listening on.
//!
//! References are keyed by connection id, so a connection whose subscribe
//! failed never releases a reference another connection took.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tagbridge_core::{ConnectionId, DeviceTag, device_tag_from_topic, event_topic, publish_topic};
use tagbridge_queue::{HandlerResult, MessageHandler, MessageQueue};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::metrics::{BROKER_ERRORS_TOTAL, BROKER_PUBLISHED_TOTAL, BROKER_SUBSCRIPTIONS_ACTIVE};
use crate::registry::ConnectionRegistry;

type Holders = Arc<RwLock<HashMap<String, HashSet<ConnectionId>>>>;

/// Decides when to subscribe/unsubscribe and routes traffic both ways.
pub struct SubscriptionManager {
    queue: Arc<dyn MessageQueue>,
    holders: Holders,
    publish_lock: Mutex<()>,
    dispatcher: Arc<TopicDispatcher>,
}

impl SubscriptionManager {
    /// Create a manager over `queue` that fans broker messages out through
    /// `registry`.
    pub fn new(queue: Arc<dyn MessageQueue>, registry: Arc<ConnectionRegistry>) -> Self {
        let holders: Holders = Arc::new(RwLock::new(HashMap::new()));
        let dispatcher = Arc::new(TopicDispatcher {
            holders: Arc::clone(&holders),
            registry,
        });
        Self {
            queue,
            holders,
            publish_lock: Mutex::new(()),
            dispatcher,
        }
    }

    /// The callback handed to the broker on every subscribe.
    pub fn dispatcher(&self) -> Arc<TopicDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Take a reference on `tag`'s subscription for `connection_id`,
    /// subscribing on the first one.
    ///
    /// The entry is only created once the broker accepted the subscribe, so a
    /// failed attempt holds nothing and is retried by the next connection.
    pub async fn on_connection_established(
        &self,
        tag: &DeviceTag,
        connection_id: &ConnectionId,
    ) -> Result<(), GatewayError> {
        let topic = event_topic(tag);
        let mut holders = self.holders.write().await;
        if let Some(ids) = holders.get_mut(&topic) {
            let _ = ids.insert(connection_id.clone());
            debug!(topic = %topic, count = ids.len(), "subscription already active");
            return Ok(());
        }

        let handler: Arc<dyn MessageHandler> = self.dispatcher();
        if let Err(source) = self.queue.subscribe(&topic, handler).await {
            counter!(BROKER_ERRORS_TOTAL, "op" => "subscribe").increment(1);
            return Err(GatewayError::Subscription { topic, source });
        }
        info!(topic = %topic, "subscribed to event topic");
        gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).increment(1.0);
        let _ = holders.insert(topic, HashSet::from([connection_id.clone()]));
        Ok(())
    }

    /// Publish a client payload for `tag`, verbatim.
    ///
    /// Rejected with [`GatewayError::State`] when no connection for `tag`
    /// holds an active subscription.
    pub async fn on_message_received(
        &self,
        tag: &DeviceTag,
        payload: &str,
    ) -> Result<(), GatewayError> {
        let subscribed = self.holders.read().await.contains_key(&event_topic(tag));
        if !subscribed {
            return Err(GatewayError::State {
                device_tag: tag.to_string(),
            });
        }

        let _guard = self.publish_lock.lock().await;
        let topic = publish_topic(tag);
        debug!(topic = %topic, payload, "publishing client message");
        if let Err(source) = self.queue.publish(&topic, payload).await {
            counter!(BROKER_ERRORS_TOTAL, "op" => "publish").increment(1);
            return Err(GatewayError::Publish { topic, source });
        }
        counter!(BROKER_PUBLISHED_TOTAL).increment(1);
        Ok(())
    }

    /// Release `connection_id`'s reference on `tag`, unsubscribing when the
    /// last holder leaves.
    ///
    /// Releasing a reference the connection does not hold is a no-op, which
    /// covers untracked tags, connections whose subscribe failed and repeated
    /// calls. When the last holder leaves, the entry is dropped even if the
    /// broker refuses the unsubscribe; the failure is returned and the
    /// broker-side subscription may linger.
    pub async fn on_client_disconnected(
        &self,
        tag: &DeviceTag,
        connection_id: &ConnectionId,
    ) -> Result<(), GatewayError> {
        let topic = event_topic(tag);
        let mut holders = self.holders.write().await;
        let Some(ids) = holders.get_mut(&topic) else {
            debug!(topic = %topic, "disconnect for untracked topic");
            return Ok(());
        };
        if !ids.remove(connection_id) {
            debug!(topic = %topic, "connection held no subscription reference");
            return Ok(());
        }
        if !ids.is_empty() {
            debug!(topic = %topic, count = ids.len(), "subscription still in use");
            return Ok(());
        }

        let _ = holders.remove(&topic);
        gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        if let Err(source) = self.queue.unsubscribe(&topic).await {
            counter!(BROKER_ERRORS_TOTAL, "op" => "unsubscribe").increment(1);
            return Err(GatewayError::Unsubscription { topic, source });
        }
        info!(topic = %topic, "unsubscribed from event topic");
        Ok(())
    }

    /// Tear down every broker subscription. Terminal.
    pub async fn on_shutdown(&self) {
        let dropped = {
            let mut holders = self.holders.write().await;
            let n = holders.len();
            holders.clear();
            n
        };
        #[allow(clippy::cast_precision_loss)]
        let dropped_gauge = dropped as f64;
        gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).decrement(dropped_gauge);
        self.queue.shutdown_all().await;
        info!(subscriptions = dropped, "broker subscriptions shut down");
    }

    /// Number of event topics with an active subscription.
    pub async fn subscription_count(&self) -> usize {
        self.holders.read().await.len()
    }

    /// Connections currently holding `tag`'s subscription.
    pub async fn subscriber_count(&self, tag: &DeviceTag) -> usize {
        self.holders
            .read()
            .await
            .get(&event_topic(tag))
            .map_or(0, HashSet::len)
    }
}

/// Broker callback: routes event-topic messages to the tag's sockets.
pub struct TopicDispatcher {
    holders: Holders,
    registry: Arc<ConnectionRegistry>,
}

impl TopicDispatcher {
    /// Fan `payload` out to the sockets of the tag encoded in `topic`.
    ///
    /// Untracked topics are ignored (`Ok(0)`). A topic that does not follow
    /// the naming convention is a [`GatewayError::TopicParse`].
    pub async fn dispatch(&self, topic: &str, payload: &str) -> Result<usize, GatewayError> {
        let tracked = self.holders.read().await.contains_key(topic);
        if !tracked {
            debug!(topic, "message for untracked topic ignored");
            return Ok(0);
        }
        let tag = device_tag_from_topic(topic)?;
        debug!(topic, payload, "received broker message");
        Ok(self.registry.broadcast(&tag, payload).await)
    }
}

#[async_trait]
impl MessageHandler for TopicDispatcher {
    async fn handle(&self, topic: &str, payload: &str) -> HandlerResult {
        // Errors here would only trigger broker redelivery of a message that
        // can never be routed.
        if let Err(e) = self.dispatch(topic, payload).await {
            warn!(topic, error = %e, "dropping undeliverable broker message");
        }
        Ok(())
    }
}
