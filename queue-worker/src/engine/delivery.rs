//! Deliveries and their dispositions.

use async_trait::async_trait;
use std::fmt;
use tracing::error;

use crate::errors::TransportError;
use crate::messages::{retry_count, DeathRecord};

/// The final decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Reject without requeueing so the dead-letter route takes it.
    Reject,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("ack"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

/// Broker-side handle that settles a delivery.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// Acknowledges the delivery.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Rejects the delivery with `requeue=false`.
    async fn reject(self: Box<Self>) -> Result<(), TransportError>;
}

/// A received message together with the handle that settles it.
///
/// Settling consumes the delivery, so it can be settled at most once.
pub struct Delivery {
    payload: Vec<u8>,
    deaths: Vec<DeathRecord>,
    handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    /// Wraps a received message.
    pub fn new(payload: Vec<u8>, deaths: Vec<DeathRecord>, handle: Box<dyn DeliveryHandle>) -> Self {
        Self {
            payload,
            deaths,
            handle,
        }
    }

    /// Raw message body.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Dead-letter history from the `x-death` header.
    #[must_use]
    pub fn deaths(&self) -> &[DeathRecord] {
        &self.deaths
    }

    /// How many times the queue has redelivered this message.
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        retry_count(&self.deaths)
    }

    /// Applies `disposition`. Failures are logged; the broker redelivers
    /// unsettled messages once the channel is gone.
    pub async fn settle(self, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => self.handle.ack().await,
            Disposition::Reject => self.handle.reject().await,
        };
        if let Err(err) = result {
            error!(error = %err, disposition = %disposition, "failed to settle delivery");
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("deaths", &self.deaths)
            .finish_non_exhaustive()
    }
}
