//! Shared connection status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the broker connection is currently up. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    connected: Arc<AtomicBool>,
}

impl ConnectionState {
    /// Creates a disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the consumers are attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Records a connection change.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}
