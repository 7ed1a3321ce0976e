//! Redis pub/sub adapter.
//!
//! One multiplexed connection carries every `PUBLISH`. Each subscribed topic
//! gets its own pub/sub connection and reader task; dropping the task drops
//! the connection, which ends the subscription on the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{MessageHandler, MessageQueue, QueueError};

/// Connection parameters for [`RedisQueue::connect`].
#[derive(Clone, Debug, Default)]
pub struct RedisOptions {
    /// `redis://host:port/db` URL.
    pub url: String,
    /// Overrides any username in the URL when non-empty.
    pub username: String,
    /// Overrides any password in the URL when non-empty.
    pub password: String,
    /// Sent with `CLIENT SETNAME` when non-empty.
    pub client_name: String,
}

/// [`MessageQueue`] backed by Redis pub/sub.
pub struct RedisQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: DashMap<String, JoinHandle<()>>,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(options: &RedisOptions) -> Result<Self, QueueError> {
        let mut info = options
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        if !options.username.is_empty() {
            info.redis.username = Some(options.username.clone());
        }
        if !options.password.is_empty() {
            info.redis.password = Some(options.password.clone());
        }

        let client = redis::Client::open(info).map_err(|e| QueueError::Connection(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        debug!(reply = %pong, "redis ping");

        if !options.client_name.is_empty() {
            let named: redis::RedisResult<()> = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(&options.client_name)
                .query_async(&mut conn)
                .await;
            if let Err(e) = named {
                warn!(error = %e, "failed to set redis client name");
            }
        }

        info!(client_name = %options.client_name, "connected to redis");
        Ok(Self {
            client,
            conn,
            readers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

fn backend(e: &redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| backend(&e))?;
        pubsub.subscribe(topic).await.map_err(|e| backend(&e))?;

        let reader_topic = topic.to_owned();
        let reader = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_owned();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(topic = %channel, error = %e, "undecodable redis payload");
                        continue;
                    }
                };
                if let Err(e) = handler.handle(&channel, &payload).await {
                    // Redis pub/sub has no redelivery.
                    warn!(topic = %channel, error = %e, "handler rejected message");
                }
            }
            debug!(topic = %reader_topic, "redis subscription stream ended");
        });

        if let Some(previous) = self.readers.insert(topic.to_owned(), reader) {
            previous.abort();
        }
        debug!(topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        let (_, reader) = self
            .readers
            .remove(topic)
            .ok_or_else(|| QueueError::NotSubscribed(topic.to_owned()))?;
        reader.abort();
        debug!(topic, "unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, payload).await.map_err(|e| backend(&e))?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn shutdown_all(&self) {
        self.closed.store(true, Ordering::Release);
        let topics: Vec<String> = self.readers.iter().map(|e| e.key().clone()).collect();
        for topic in &topics {
            if let Some((_, reader)) = self.readers.remove(topic) {
                reader.abort();
            }
        }
        info!(topics = topics.len(), "redis queue shut down");
    }
}
