//! Device session lifecycle: one socket from upgrade through close.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tagbridge_core::envelope::{MSG_CONNECTION_ESTABLISHED, MSG_MESSAGE_SENT, MSG_TEXT_ONLY};
use tagbridge_core::{ConnectionId, DeviceTag, ResponseEnvelope, TagError, validate_action_message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::error::GatewayError;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_REJECTED_TOTAL,
};
use crate::registry::ConnectionRegistry;
use crate::subscriptions::SubscriptionManager;

/// How long the writer may keep flushing queued frames after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Open sockets by tag.
    pub registry: Arc<ConnectionRegistry>,
    /// Subscription refcounting and publishing.
    pub subscriptions: Arc<SubscriptionManager>,
    /// Outbound queue length per connection.
    pub send_queue_capacity: usize,
    /// Check client frames as action messages before publishing.
    pub validate_actions: bool,
    /// Fires on server shutdown.
    pub shutdown: CancellationToken,
}

/// Answer an upgrade that carried no usable device tag, then close.
///
/// No core state is touched.
pub async fn reject_session(mut ws: WebSocket, reason: &TagError) {
    counter!(WS_REJECTED_TOTAL).increment(1);
    info!(error = %reason, "rejecting device connection");
    let json = ResponseEnvelope::error(reason.to_string()).to_json();
    if ws.send(Message::Text(json.into())).await.is_ok() {
        let _ = ws.send(Message::Close(None)).await;
    }
}

/// Run a device session until the socket closes or the server shuts down.
///
/// 1. Registers the connection and ensures the tag's subscription
/// 2. Sends the `Connection established` envelope, then an error envelope if
///    the subscription could not be created
/// 3. Publishes text frames and answers each with an envelope
/// 4. On every exit path, unregisters the connection and releases its
///    subscription reference through a [`SessionRelease`]
#[instrument(skip_all, fields(device_tag = %device_tag, connection_id = %connection_id))]
pub async fn run_device_session(
    ws: WebSocket,
    device_tag: DeviceTag,
    connection_id: ConnectionId,
    ctx: SessionContext,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(ctx.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(
        connection_id.clone(),
        device_tag.clone(),
        send_tx,
    ));

    let mut writer = tokio::spawn(async move {
        while let Some(text) = send_rx.recv().await {
            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    info!("device connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let release = SessionRelease::new(&ctx, &device_tag, &connection_id);
    ctx.registry.add_connection(Arc::clone(&connection)).await;
    let subscribed = ctx
        .subscriptions
        .on_connection_established(&device_tag, &connection_id)
        .await;

    let _ = connection.send_envelope(&ResponseEnvelope::success(MSG_CONNECTION_ESTABLISHED));
    if let Err(e) = subscribed {
        warn!(error = %e, "subscription failed, connection kept open");
        let _ = connection.send_envelope(&ResponseEnvelope::error(e.to_string()));
    }

    loop {
        let frame = tokio::select! {
            () = ctx.shutdown.cancelled() => {
                debug!("server shutting down, closing session");
                break;
            }
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_text(&ctx, &connection, text.as_str()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "binary frame rejected");
                let _ = connection.send_envelope(&ResponseEnvelope::error(MSG_TEXT_ONLY));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                debug!("client sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                break;
            }
            None => break,
        }
    }

    release.release().await;

    let lifetime = connection.age();
    let dropped = connection.drop_count();
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(dropped, "device disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(lifetime.as_secs_f64());
}

/// What a session owns in shared state: its registry entry and its
/// subscription reference.
#[derive(Clone)]
struct ReleaseTarget {
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    device_tag: DeviceTag,
    connection_id: ConnectionId,
}

impl ReleaseTarget {
    async fn run(self) {
        let _ = self
            .registry
            .remove_connection(&self.device_tag, &self.connection_id)
            .await;
        if let Err(e) = self
            .subscriptions
            .on_client_disconnected(&self.device_tag, &self.connection_id)
            .await
        {
            warn!(error = %e, "failed to release subscription");
        }
    }
}

/// Releases a session's shared state exactly once.
///
/// The normal path awaits [`SessionRelease::release`]. If the session future
/// is dropped or unwinds first, `Drop` spawns the same release on the
/// current runtime. Both steps are idempotent per connection id, so a
/// release interrupted mid-way is safe to run again.
struct SessionRelease {
    target: Option<ReleaseTarget>,
}

impl SessionRelease {
    fn new(ctx: &SessionContext, device_tag: &DeviceTag, connection_id: &ConnectionId) -> Self {
        Self {
            target: Some(ReleaseTarget {
                registry: Arc::clone(&ctx.registry),
                subscriptions: Arc::clone(&ctx.subscriptions),
                device_tag: device_tag.clone(),
                connection_id: connection_id.clone(),
            }),
        }
    }

    async fn release(mut self) {
        if let Some(target) = self.target.clone() {
            target.run().await;
        }
        self.target = None;
    }
}

impl Drop for SessionRelease {
    fn drop(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        warn!(
            device_tag = %target.device_tag,
            connection_id = %target.connection_id,
            "session ended abnormally, releasing in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn(target.run())),
            Err(_) => warn!("no runtime to release session state"),
        }
    }
}

async fn handle_text(ctx: &SessionContext, connection: &ClientConnection, text: &str) {
    if ctx.validate_actions {
        if let Err(e) = validate_action_message(text) {
            let err = GatewayError::from(e);
            debug!(error = %err, "client message failed validation");
            let _ = connection.send_envelope(&ResponseEnvelope::error(err.to_string()));
            return;
        }
    }

    let reply = match ctx
        .subscriptions
        .on_message_received(&connection.device_tag, text)
        .await
    {
        Ok(()) => ResponseEnvelope::success(MSG_MESSAGE_SENT),
        Err(e) => {
            warn!(error = %e, "client message not published");
            ResponseEnvelope::error(e.to_string())
        }
    };
    if !connection.send_envelope(&reply) {
        warn!("failed to enqueue reply (channel full or closed)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagbridge_queue::testing::RecordingQueue;

    fn context(queue: Arc<RecordingQueue>, validate_actions: bool) -> SessionContext {
        let registry = Arc::new(ConnectionRegistry::new());
        SessionContext {
            subscriptions: Arc::new(SubscriptionManager::new(queue, Arc::clone(&registry))),
            registry,
            send_queue_capacity: 8,
            validate_actions,
            shutdown: CancellationToken::new(),
        }
    }

    fn connection(tag: &str) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ClientConnection::new(ConnectionId::new(), DeviceTag::parse(tag).unwrap(), tx);
        (conn, rx)
    }

    async fn reply(rx: &mut mpsc::Receiver<Arc<String>>) -> ResponseEnvelope {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn published_text_gets_success_reply() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), false);
        let (conn, mut rx) = connection("x");
        ctx.subscriptions
            .on_connection_established(&conn.device_tag, &conn.id)
            .await
            .unwrap();

        handle_text(&ctx, &conn, "not even json").await;
        assert_eq!(reply(&mut rx).await, ResponseEnvelope::success(MSG_MESSAGE_SENT));
        assert_eq!(
            queue.published(),
            vec![("cloud.msg.x".to_string(), "not even json".to_string())]
        );
    }

    #[tokio::test]
    async fn unsubscribed_text_gets_error_reply() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), false);
        let (conn, mut rx) = connection("beta");

        handle_text(&ctx, &conn, "{}").await;
        let env = reply(&mut rx).await;
        assert!(!env.is_success());
        assert!(env.message.contains("'beta'"));
        assert_eq!(queue.publish_calls(), 0);
    }

    #[tokio::test]
    async fn validation_rejects_before_publish() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), true);
        let (conn, mut rx) = connection("x");
        ctx.subscriptions
            .on_connection_established(&conn.device_tag, &conn.id)
            .await
            .unwrap();

        handle_text(&ctx, &conn, r#"{"action":""}"#).await;
        assert!(!reply(&mut rx).await.is_success());
        assert_eq!(queue.publish_calls(), 0);

        handle_text(&ctx, &conn, r#"{"action":"reboot"}"#).await;
        assert!(reply(&mut rx).await.is_success());
        assert_eq!(queue.publish_calls(), 1);
    }

    async fn attached(ctx: &SessionContext, tag: &str) -> (Arc<ClientConnection>, SessionRelease) {
        let (conn, _rx) = connection(tag);
        let conn = Arc::new(conn);
        let release = SessionRelease::new(ctx, &conn.device_tag, &conn.id);
        ctx.registry.add_connection(Arc::clone(&conn)).await;
        ctx.subscriptions
            .on_connection_established(&conn.device_tag, &conn.id)
            .await
            .unwrap();
        (conn, release)
    }

    #[tokio::test]
    async fn release_unregisters_and_unsubscribes_once() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), false);
        let (_conn, release) = attached(&ctx, "alpha").await;

        release.release().await;
        assert_eq!(ctx.registry.connection_count().await, 0);
        assert_eq!(ctx.subscriptions.subscription_count().await, 0);
        assert_eq!(queue.unsubscribe_calls(), 1);

        tokio::task::yield_now().await;
        assert_eq!(queue.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn dropped_session_releases_in_background() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), false);
        let (_conn, release) = attached(&ctx, "alpha").await;

        drop(release);
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.subscriptions.subscription_count().await != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ctx.registry.connection_count().await, 0);
        assert_eq!(queue.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn aborted_session_task_releases() {
        let queue = Arc::new(RecordingQueue::new());
        let ctx = context(Arc::clone(&queue), false);
        let (_conn, release) = attached(&ctx, "alpha").await;

        let task = tokio::spawn(async move {
            let _release = release;
            std::future::pending::<()>().await;
        });
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.registry.connection_count().await != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.unsubscribe_calls() != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
