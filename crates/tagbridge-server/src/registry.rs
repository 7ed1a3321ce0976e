//! Live sockets grouped by device tag, and fan-out to them.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use tagbridge_core::{ConnectionId, DeviceTag};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::error::GatewayError;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_FANOUT_DROPS_TOTAL, WS_FANOUT_MESSAGES_TOTAL};

type TagConnections = HashMap<ConnectionId, Arc<ClientConnection>>;

/// Registry of open sockets.
///
/// A tag key exists iff at least one open connection references it.
pub struct ConnectionRegistry {
    tags: RwLock<HashMap<DeviceTag, TagConnections>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tags: RwLock::new(HashMap::new()),
        }
    }

    /// Register `connection` under its device tag.
    pub async fn add_connection(&self, connection: Arc<ClientConnection>) {
        let mut tags = self.tags.write().await;
        let previous = tags
            .entry(connection.device_tag.clone())
            .or_default()
            .insert(connection.id.clone(), connection);
        if previous.is_none() {
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        }
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    ///
    /// Returns whether the connection was present.
    pub async fn remove_connection(&self, tag: &DeviceTag, id: &ConnectionId) -> bool {
        let mut tags = self.tags.write().await;
        let Some(conns) = tags.get_mut(tag) else {
            return false;
        };
        let removed = conns.remove(id).is_some();
        if conns.is_empty() {
            let _ = tags.remove(tag);
        }
        if removed {
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Queue `payload` on every socket registered for `tag`.
    ///
    /// A socket that cannot take the write is logged and skipped. Returns the
    /// number of sockets the payload was queued on; a tag without sockets
    /// yields `0`.
    pub async fn broadcast(&self, tag: &DeviceTag, payload: &str) -> usize {
        let tags = self.tags.read().await;
        let Some(conns) = tags.get(tag) else {
            debug!(device_tag = %tag, "no sockets for device tag, nothing to fan out");
            return 0;
        };
        let message = Arc::new(payload.to_owned());
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.send(Arc::clone(&message)) {
                delivered += 1;
            } else {
                let err = GatewayError::TransportWrite {
                    connection_id: conn.id.to_string(),
                };
                warn!(device_tag = %tag, error = %err, "dropping message for stale socket");
                counter!(WS_FANOUT_DROPS_TOTAL).increment(1);
            }
        }
        counter!(WS_FANOUT_MESSAGES_TOTAL).increment(delivered as u64);
        debug!(device_tag = %tag, recipients = delivered, "fanned out broker message");
        delivered
    }

    /// Number of open connections across all tags.
    pub async fn connection_count(&self) -> usize {
        self.tags.read().await.values().map(HashMap::len).sum()
    }

    /// Number of device tags with at least one open connection.
    pub async fn tag_count(&self) -> usize {
        self.tags.read().await.len()
    }

    /// Number of open connections for `tag`.
    pub async fn connections_for(&self, tag: &DeviceTag) -> usize {
        self.tags.read().await.get(tag).map_or(0, HashMap::len)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tag(s: &str) -> DeviceTag {
        DeviceTag::parse(s).unwrap()
    }

    fn make_connection(
        id: &str,
        device_tag: &str,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(ConnectionId::from(id), tag(device_tag), tx);
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn add_and_remove() {
        let reg = ConnectionRegistry::new();
        let (c1, _rx1) = make_connection("c1", "alpha", 8);
        let (c2, _rx2) = make_connection("c2", "alpha", 8);
        reg.add_connection(c1).await;
        reg.add_connection(c2).await;
        assert_eq!(reg.connection_count().await, 2);
        assert_eq!(reg.tag_count().await, 1);

        assert!(reg.remove_connection(&tag("alpha"), &ConnectionId::from("c1")).await);
        assert_eq!(reg.connections_for(&tag("alpha")).await, 1);
        assert!(reg.remove_connection(&tag("alpha"), &ConnectionId::from("c2")).await);
        assert_eq!(reg.tag_count().await, 0);
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let reg = ConnectionRegistry::new();
        assert!(!reg.remove_connection(&tag("alpha"), &ConnectionId::from("c1")).await);

        let (c1, _rx) = make_connection("c1", "alpha", 8);
        reg.add_connection(c1).await;
        assert!(!reg.remove_connection(&tag("alpha"), &ConnectionId::from("zz")).await);
        assert!(reg.remove_connection(&tag("alpha"), &ConnectionId::from("c1")).await);
        assert!(!reg.remove_connection(&tag("alpha"), &ConnectionId::from("c1")).await);
        assert_eq!(reg.tag_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_matching_tag() {
        let reg = ConnectionRegistry::new();
        let (a1, mut rx_a1) = make_connection("a1", "alpha", 8);
        let (a2, mut rx_a2) = make_connection("a2", "alpha", 8);
        let (b1, mut rx_b1) = make_connection("b1", "beta", 8);
        reg.add_connection(a1).await;
        reg.add_connection(a2).await;
        reg.add_connection(b1).await;

        assert_eq!(reg.broadcast(&tag("alpha"), r#"{"x":1}"#).await, 2);
        assert_eq!(&*rx_a1.recv().await.unwrap(), r#"{"x":1}"#);
        assert_eq!(&*rx_a2.recv().await.unwrap(), r#"{"x":1}"#);
        assert!(rx_b1.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_unknown_tag_is_silent() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.broadcast(&tag("nobody"), "{}").await, 0);
    }

    #[tokio::test]
    async fn stale_socket_does_not_block_others() {
        let reg = ConnectionRegistry::new();
        let (stale, rx_stale) = make_connection("stale", "alpha", 8);
        let (live, mut rx_live) = make_connection("live", "alpha", 8);
        drop(rx_stale);
        reg.add_connection(Arc::clone(&stale)).await;
        reg.add_connection(live).await;

        assert_eq!(reg.broadcast(&tag("alpha"), "payload").await, 1);
        assert_eq!(&*rx_live.recv().await.unwrap(), "payload");
        assert_eq!(stale.drop_count(), 1);
    }
}
