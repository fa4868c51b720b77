//! Dead-letter history carried in delivery headers.

use serde::{Deserialize, Serialize};

/// One entry of the broker's `x-death` header.
///
/// The broker keeps the most recent dead-lettering first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Times the message was dead-lettered for this queue and reason.
    pub count: u64,
    /// Why it was dead-lettered (`rejected`, `expired`, ...).
    pub reason: Option<String>,
    /// Queue it was dead-lettered from.
    pub queue: Option<String>,
}

impl DeathRecord {
    /// Creates a record with a count and reason.
    #[must_use]
    pub fn new(count: u64, reason: impl Into<String>) -> Self {
        Self {
            count,
            reason: Some(reason.into()),
            queue: None,
        }
    }
}

/// Number of prior redeliveries: `x-death[0].count`, or zero when the
/// history is absent.
#[must_use]
pub fn retry_count(history: &[DeathRecord]) -> u64 {
    history.first().map_or(0, |record| record.count)
}
