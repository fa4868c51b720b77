//! In-memory deliveries.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::engine::{Delivery, DeliveryHandle, Disposition};
use crate::errors::TransportError;
use crate::messages::DeathRecord;

/// Shared record of the dispositions applied through [`RecordingHandle`]s.
#[derive(Debug, Clone, Default)]
pub struct DispositionLog {
    entries: Arc<Mutex<Vec<Disposition>>>,
}

impl DispositionLog {
    /// Dispositions in the order they were applied.
    #[must_use]
    pub fn dispositions(&self) -> Vec<Disposition> {
        self.entries.lock().clone()
    }

    fn push(&self, disposition: Disposition) {
        self.entries.lock().push(disposition);
    }
}

/// A delivery handle that writes to a [`DispositionLog`].
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    log: DispositionLog,
}

impl RecordingHandle {
    /// Creates a handle writing to `log`.
    #[must_use]
    pub fn new(log: DispositionLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl DeliveryHandle for RecordingHandle {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.log.push(Disposition::Ack);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), TransportError> {
        self.log.push(Disposition::Reject);
        Ok(())
    }
}

/// Builds a delivery whose settlement lands in the returned log.
#[must_use]
pub fn recorded_delivery(payload: Vec<u8>, deaths: Vec<DeathRecord>) -> (Delivery, DispositionLog) {
    let log = DispositionLog::default();
    let handle = RecordingHandle::new(log.clone());
    (Delivery::new(payload, deaths, Box::new(handle)), log)
}
