//! Gateway stop sequence.
//!
//! The HTTP listener and every device session observe one token. Broker
//! teardown follows the listener and runs once, from whichever side gets
//! there first: the serve task after a clean drain, or
//! [`ShutdownSequence::run`] once the drain has timed out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::subscriptions::SubscriptionManager;

/// How long the listener may take to drain before it is aborted.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The serve task finished on its own.
    Drained,
    /// The serve task was aborted after the drain timeout.
    TimedOut,
}

/// Drives the gateway from serving to stopped.
pub struct ShutdownSequence {
    token: CancellationToken,
    subscriptions: Arc<SubscriptionManager>,
    torn_down: AtomicBool,
}

impl ShutdownSequence {
    /// A sequence that tears down `subscriptions` once the listener stops.
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            token: CancellationToken::new(),
            subscriptions,
            torn_down: AtomicBool::new(false),
        }
    }

    /// A clone of the token sessions and the listener watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting and close every session. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drop every broker subscription. Returns `false` if it already ran.
    pub async fn teardown_broker(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.subscriptions.on_shutdown().await;
        true
    }

    /// Trigger, wait up to `drain_timeout` for the serve task, then make sure
    /// the broker has been torn down.
    pub async fn run(
        &self,
        mut server: JoinHandle<()>,
        drain_timeout: Option<Duration>,
    ) -> StopOutcome {
        let drain_timeout = drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.trigger();
        info!(timeout_secs = drain_timeout.as_secs(), "draining gateway");

        let outcome = match tokio::time::timeout(drain_timeout, &mut server).await {
            Ok(Ok(())) => StopOutcome::Drained,
            Ok(Err(e)) => {
                warn!(error = %e, "serve task ended abnormally");
                StopOutcome::Drained
            }
            Err(_) => {
                warn!("drain timed out after {drain_timeout:?}, aborting listener");
                server.abort();
                StopOutcome::TimedOut
            }
        };
        if self.teardown_broker().await {
            info!("broker torn down without the listener");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use tagbridge_core::{ConnectionId, DeviceTag};
    use tagbridge_queue::testing::RecordingQueue;

    fn sequence() -> (Arc<RecordingQueue>, Arc<ShutdownSequence>) {
        let queue = Arc::new(RecordingQueue::new());
        let subscriptions = Arc::new(SubscriptionManager::new(
            queue.clone(),
            Arc::new(ConnectionRegistry::new()),
        ));
        (queue, Arc::new(ShutdownSequence::new(subscriptions)))
    }

    #[test]
    fn trigger_cancels_shared_token() {
        let (_queue, seq) = sequence();
        let token = seq.token();
        assert!(!seq.is_triggered());
        seq.trigger();
        seq.trigger();
        assert!(token.is_cancelled());
        assert!(seq.is_triggered());
    }

    #[tokio::test]
    async fn broker_teardown_runs_once() {
        let (queue, seq) = sequence();
        let tag = DeviceTag::parse("alpha").unwrap();
        seq.subscriptions
            .on_connection_established(&tag, &ConnectionId::from("c1"))
            .await
            .unwrap();

        assert!(seq.teardown_broker().await);
        assert!(!seq.teardown_broker().await);
        assert_eq!(queue.shutdown_calls(), 1);
        assert_eq!(seq.subscriptions.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn clean_drain_leaves_teardown_to_listener() {
        let (queue, seq) = sequence();
        let listener = Arc::clone(&seq);
        let token = seq.token();
        let serve = tokio::spawn(async move {
            token.cancelled().await;
            let _ = listener.teardown_broker().await;
        });

        let outcome = seq.run(serve, Some(Duration::from_secs(1))).await;
        assert_eq!(outcome, StopOutcome::Drained);
        assert_eq!(queue.shutdown_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_listener_is_aborted_and_broker_still_torn_down() {
        let (queue, seq) = sequence();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let outcome = seq.run(stuck, Some(Duration::from_millis(50))).await;
        assert_eq!(outcome, StopOutcome::TimedOut);
        assert!(seq.is_triggered());
        assert_eq!(queue.shutdown_calls(), 1);
    }
}
