//! Deferred verification of soft-failed starts.
//!
//! A `start` the backend could not honour is republished to the retry
//! queue as a `verify` job. The connection is opened on first use and
//! shared by every later push until it drops, when the next push opens a
//! fresh one. Each push uses a short-lived confirm channel.

mod connection;

pub use connection::{ConnectionSlot, Liveness};

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{error, info};

use crate::config::RabbitmqConfig;
use crate::errors::PublishError;
use crate::messages::{BuildConfig, RetryEnvelope, CONTENT_TYPE_JSON};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Publishes builds for later verification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    /// Publishes a `verify` envelope for `config`.
    ///
    /// `correlation_id` identifies the originating build in logs and in
    /// the message properties.
    async fn push(&self, config: &BuildConfig, correlation_id: &str) -> Result<(), PublishError>;
}

/// Retry queue publisher backed by a lazily opened broker connection.
pub struct AmqpRetryQueue {
    endpoint: AMQPUri,
    exchange: String,
    routing_key: String,
    enabled: bool,
    connection: ConnectionSlot<Connection>,
}

impl AmqpRetryQueue {
    /// Creates a publisher from the broker settings. Nothing connects
    /// until the first push.
    #[must_use]
    pub fn new(config: &RabbitmqConfig) -> Self {
        Self {
            endpoint: config.amqp_endpoint(),
            exchange: config.exchange.clone(),
            routing_key: config.retry_queue.clone(),
            enabled: config.retry_queue_enabled,
            connection: ConnectionSlot::new(),
        }
    }

    /// Whether pushes are published at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a live shared connection is held.
    pub async fn is_connected(&self) -> bool {
        self.connection.is_live().await
    }

    async fn open_channel(&self) -> Result<Channel, PublishError> {
        let connection = self
            .connection
            .get_or_connect(|| {
                Connection::connect_uri(self.endpoint.clone(), ConnectionProperties::default())
            })
            .await?;
        Ok(connection.create_channel().await?)
    }

    async fn publish(&self, channel: &Channel, payload: &[u8], correlation_id: &str) -> Result<(), PublishError> {
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(correlation_id.into());

        let confirmation = channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublishError::NotConfirmed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AmqpRetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpRetryQueue")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RetryPublisher for AmqpRetryQueue {
    async fn push(&self, config: &BuildConfig, correlation_id: &str) -> Result<(), PublishError> {
        if !self.enabled {
            return Ok(());
        }

        let payload = serde_json::to_vec(&RetryEnvelope::verify(config))?;
        let channel = self.open_channel().await?;

        info!(message_id = %correlation_id, "publishing msg to retry queue");
        let result = self.publish(&channel, &payload, correlation_id).await;

        if let Err(err) = channel.close(200, "").await {
            error!(error = %err, "failed to close retry queue channel");
        }

        match &result {
            Ok(()) => info!(
                message_id = %correlation_id,
                queue = %self.routing_key,
                "successfully published msg to retry queue"
            ),
            Err(err) => error!(error = %err, "publishing failed to retry queue"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool) -> RabbitmqConfig {
        RabbitmqConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            retry_queue: "delayed".to_string(),
            retry_queue_enabled: enabled,
            ..RabbitmqConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_push_is_a_noop() {
        let queue = AmqpRetryQueue::new(&settings(false));
        let config = BuildConfig::new(11, 1, "http://api", "t");

        queue.push(&config, "11").await.unwrap();

        assert!(!queue.is_enabled());
        assert!(!queue.is_connected().await);
    }

    #[tokio::test]
    async fn test_enabled_push_surfaces_broker_errors() {
        let queue = AmqpRetryQueue::new(&settings(true));
        let config = BuildConfig::new(11, 1, "http://api", "t");

        let err = queue.push(&config, "11").await.unwrap_err();

        assert!(matches!(err, PublishError::Broker(_)));
        assert!(!queue.is_connected().await);

        let err = queue.push(&config, "11").await.unwrap_err();
        assert!(matches!(err, PublishError::Broker(_)));
    }

    #[test]
    fn test_routes_by_retry_queue_name() {
        let queue = AmqpRetryQueue::new(&settings(true));
        assert_eq!(queue.routing_key, "delayed");
        assert_eq!(queue.exchange, "build");
    }
}
