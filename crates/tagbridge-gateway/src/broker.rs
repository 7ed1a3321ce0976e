//! Broker selection and startup connect.

use std::sync::Arc;

use tagbridge_queue::redis_pubsub::{RedisOptions, RedisQueue};
use tagbridge_queue::{InMemoryQueue, MessageQueue};
use tagbridge_server::GatewayError;
use tagbridge_settings::{BrokerKind, BrokerSettings};
use tracing::info;

/// Build the configured broker. An unreachable broker is a configuration error.
pub async fn connect_queue(settings: &BrokerSettings) -> Result<Arc<dyn MessageQueue>, GatewayError> {
    match settings.kind {
        BrokerKind::Memory => {
            info!("using in-process message bus");
            Ok(Arc::new(InMemoryQueue::new()))
        }
        BrokerKind::Redis => {
            let options = RedisOptions {
                url: settings.url.clone(),
                username: settings.username.clone(),
                password: settings.password.clone(),
                client_name: settings.client_name.clone(),
            };
            let queue = RedisQueue::connect(&options)
                .await
                .map_err(|e| GatewayError::Configuration(format!("redis broker unreachable: {e}")))?;
            Ok(Arc::new(queue))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_broker_is_ready() {
        let queue = connect_queue(&BrokerSettings::default()).await.unwrap();
        assert!(queue.publish("cloud.msg.a", "{}").await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_redis_is_configuration_error() {
        let settings = BrokerSettings {
            kind: BrokerKind::Redis,
            url: "redis://127.0.0.1:1".into(),
            ..BrokerSettings::default()
        };
        let err = connect_queue(&settings).await.err().unwrap();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn malformed_redis_url_is_configuration_error() {
        let settings = BrokerSettings {
            kind: BrokerKind::Redis,
            url: "not a url".into(),
            ..BrokerSettings::default()
        };
        assert!(matches!(
            connect_queue(&settings).await,
            Err(GatewayError::Configuration(_))
        ));
    }
}
