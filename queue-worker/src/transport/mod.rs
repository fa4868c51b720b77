//! Broker connection management.
//!
//! The [`ConnectionManager`] owns the AMQP connection. It consumes the
//! primary queue (and the retry queue when enabled) on one channel whose
//! prefetch bounds the deliveries in flight, hands every delivery to the
//! engine on its own task, and reconnects with backoff when the broker goes
//! away. Exceeding the reconnect limit is fatal.

mod backoff;
mod death;
mod state;

pub use backoff::ReconnectBackoff;
pub use death::{death_records, X_DEATH};
pub use state::ConnectionState;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::config::RabbitmqConfig;
use crate::engine::{Delivery, DeliveryHandle, Disposition, MessageEngine};
use crate::errors::TransportError;

type DeliveryStream = BoxStream<'static, (Source, Result<lapin::message::Delivery, lapin::Error>)>;

/// Queue a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Primary,
    Retry,
}

struct AmqpDeliveryHandle {
    acker: Acker,
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let deaths = death_records(delivery.properties.headers().as_ref());
    Delivery::new(
        delivery.data,
        deaths,
        Box::new(AmqpDeliveryHandle {
            acker: delivery.acker,
        }),
    )
}

struct Session {
    connection: Connection,
    deliveries: DeliveryStream,
}

/// Consumes the configured queues and keeps the connection alive.
pub struct ConnectionManager {
    config: RabbitmqConfig,
    engine: Arc<MessageEngine>,
    state: ConnectionState,
}

impl ConnectionManager {
    /// Creates a manager; nothing connects until [`run`](Self::run).
    pub fn new(config: RabbitmqConfig, engine: Arc<MessageEngine>, state: ConnectionState) -> Self {
        Self {
            config,
            engine,
            state,
        }
    }

    /// The connection flag shared with the health route.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    /// Consumes until `shutdown` resolves or reconnection gives up.
    ///
    /// On shutdown no further deliveries are taken, handlers already
    /// running are awaited, and the connection is closed.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let limit = self.config.connect_options.reconnect_limit;
        let mut backoff = ReconnectBackoff::from_options(&self.config.connect_options);
        let mut failures: u32 = 0;
        let mut in_flight = JoinSet::new();

        loop {
            let opened = tokio::select! {
                biased;
                () = &mut shutdown => break,
                opened = self.open_session() => opened,
            };

            let err = match opened {
                Ok(mut session) => {
                    failures = 0;
                    backoff.reset();
                    self.state.set_connected(true);

                    let ended = self
                        .consume(&mut session.deliveries, &mut in_flight, &mut shutdown)
                        .await;
                    self.state.set_connected(false);

                    match ended {
                        Ok(()) => {
                            drain(&mut in_flight).await;
                            if let Err(err) = session.connection.close(200, "").await {
                                warn!(error = %err, "failed to close broker connection");
                            }
                            info!(stats = %self.engine.stats().to_json(), "consumer stopped");
                            return Ok(());
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                host = %self.config.host,
                                "server disconnected, reconnecting"
                            );
                            err
                        }
                    }
                }
                Err(err) => err,
            };

            failures = failures.saturating_add(1);
            if failures > limit {
                error!(attempts = failures, limit, error = %err, "reconnect limit exceeded");
                return Err(TransportError::ReconnectLimitExceeded {
                    attempts: failures,
                    last_error: err.to_string(),
                });
            }

            let delay = backoff.next_delay();
            warn!(
                attempt = failures,
                limit,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "broker unavailable, retrying connection"
            );
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        drain(&mut in_flight).await;
        info!(stats = %self.engine.stats().to_json(), "consumer stopped");
        Ok(())
    }

    async fn open_session(&self) -> Result<Session, TransportError> {
        let connection =
            Connection::connect_uri(self.config.amqp_endpoint(), ConnectionProperties::default())
                .await?;
        info!(host = %self.config.host, "rabbitmq server connected");

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions { global: true })
            .await?;

        let mut deliveries = subscribe(&channel, &self.config.queue, Source::Primary).await?;
        info!(queue = %self.config.queue, "waiting for messages");

        if self.config.retry_queue_enabled {
            let retry = subscribe(&channel, &self.config.retry_queue, Source::Retry).await?;
            info!(queue = %self.config.retry_queue, "waiting for messages");
            deliveries = stream::select(deliveries, retry).boxed();
        }

        Ok(Session {
            connection,
            deliveries,
        })
    }

    async fn consume<F>(
        &self,
        deliveries: &mut DeliveryStream,
        in_flight: &mut JoinSet<Disposition>,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                biased;
                () = shutdown.as_mut() => {
                    info!("shutdown requested, no longer consuming");
                    return Ok(());
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
                next = deliveries.next() => match next {
                    Some((source, Ok(delivery))) => self.spawn_handler(in_flight, source, delivery),
                    Some((_, Err(err))) => return Err(err.into()),
                    None => return Err(TransportError::ConsumerClosed(self.config.queue.clone())),
                },
            }
        }
    }

    fn spawn_handler(
        &self,
        in_flight: &mut JoinSet<Disposition>,
        source: Source,
        delivery: lapin::message::Delivery,
    ) {
        let engine = Arc::clone(&self.engine);
        let delivery = into_delivery(delivery);
        in_flight.spawn(async move {
            match source {
                Source::Primary => engine.on_message(delivery).await,
                Source::Retry => engine.on_retry_message(delivery).await,
            }
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.config.host)
            .field("queue", &self.config.queue)
            .field("connected", &self.state.is_connected())
            .finish_non_exhaustive()
    }
}

async fn subscribe(channel: &Channel, queue: &str, source: Source) -> Result<DeliveryStream, TransportError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    let consumer = channel
        .basic_consume(
            queue,
            &format!("queue-worker-{queue}"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(consumer.map(move |delivery| (source, delivery)).boxed())
}

async fn drain(in_flight: &mut JoinSet<Disposition>) {
    if !in_flight.is_empty() {
        info!(count = in_flight.len(), "waiting for in-flight deliveries");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<Disposition, JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "delivery handler terminated abnormally");
    }
}
