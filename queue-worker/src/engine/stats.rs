//! Process-lifetime engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use super::Disposition;

/// Counters for delivery outcomes.
#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    decode_failures: AtomicU64,
    escalations: AtomicU64,
    deferred: AtomicU64,
}

impl EngineStats {
    /// Records a delivery entering the engine.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the disposition applied to a delivery.
    pub fn record_disposition(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a payload that could not be decoded.
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a build marked failed upstream.
    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a start deferred to the retry queue.
    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliveries received.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Deliveries acknowledged.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Deliveries rejected.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Malformed payloads.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Builds marked failed.
    #[must_use]
    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    /// Starts deferred to the retry queue.
    #[must_use]
    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Deliveries received but not yet settled.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.received()
            .saturating_sub(self.acked() + self.rejected())
    }

    /// Snapshot for logging.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "received": self.received(),
            "acked": self.acked(),
            "rejected": self.rejected(),
            "decode_failures": self.decode_failures(),
            "escalations": self.escalations(),
            "deferred": self.deferred(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_dispositions() {
        let stats = EngineStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_received();
        stats.record_disposition(Disposition::Ack);
        stats.record_disposition(Disposition::Reject);

        assert_eq!(stats.acked(), 1);
        assert_eq!(stats.rejected(), 1);
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.to_json()["received"], 3);
    }
}
