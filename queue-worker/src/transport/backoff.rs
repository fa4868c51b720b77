//! Reconnection delays.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectOptions;

/// Exponential backoff with equal jitter: half of each delay is fixed, the
/// other half random.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Creates a backoff from `base` capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Reads delays from the connect options. Negative or non-finite
    /// values fall back to one second.
    #[must_use]
    pub fn from_options(options: &ConnectOptions) -> Self {
        let secs = |value: f64| Duration::try_from_secs_f64(value).unwrap_or(Duration::from_secs(1));
        Self::new(
            secs(options.reconnect_delay_secs),
            secs(options.reconnect_max_delay_secs),
        )
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forgets previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let half = millis / 2;
        if half == 0 {
            return delay;
        }
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
    }

    fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}
