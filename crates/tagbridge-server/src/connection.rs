//! Per-socket connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tagbridge_core::{ConnectionId, DeviceTag, ResponseEnvelope};
use tokio::sync::mpsc;

/// One live device socket.
///
/// Writes never touch the socket directly: they are queued on a bounded
/// channel drained by the session's writer task.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Device tag the socket was opened for.
    pub device_tag: DeviceTag,
    tx: mpsc::Sender<Arc<String>>,
    /// When the socket was accepted.
    pub connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection writing into `tx`.
    pub fn new(id: ConnectionId, device_tag: DeviceTag, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            device_tag,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a response envelope.
    pub fn send_envelope(&self, envelope: &ResponseEnvelope) -> bool {
        self.send(Arc::new(envelope.to_json()))
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
