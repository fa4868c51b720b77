//! Shared producer connection that is replaced once it dies.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A connection whose liveness can be checked without a round trip.
pub trait Liveness {
    /// Whether the connection can still open channels.
    fn is_live(&self) -> bool;
}

impl Liveness for lapin::Connection {
    fn is_live(&self) -> bool {
        self.status().connected()
    }
}

/// One cached connection shared by every publisher call.
///
/// Callers are serialized while a connection is being opened, so concurrent
/// pushes never open more than one.
pub struct ConnectionSlot<C> {
    slot: Mutex<Option<Arc<C>>>,
}

impl<C: Liveness> ConnectionSlot<C> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached connection, opening a new one with `connect`
    /// when the slot is empty or its connection is no longer live.
    ///
    /// A failed `connect` leaves the slot empty.
    pub async fn get_or_connect<F, Fut, E>(&self, connect: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(conn) if conn.is_live() => {
                *slot = Some(Arc::clone(&conn));
                return Ok(conn);
            }
            Some(_) => warn!("retry queue connection lost, reconnecting"),
            None => info!("creating new retry queue connection"),
        }

        let conn = Arc::new(connect().await?);
        info!("connected to retry queue");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Whether a live connection is cached.
    pub async fn is_live(&self) -> bool {
        self.slot.lock().await.as_ref().is_some_and(|conn| conn.is_live())
    }
}

impl<C: Liveness> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}
