//! Reconnect interval arithmetic.
//!
//! The delay starts at `min`, and each failure-driven reconnect consumes the
//! current value and grows the next one to `min(floor(current * jitter), max)`
//! at millisecond resolution, never dropping below `current`. With
//! `min = 300ms` and `jitter = 1.2` the sequence is 300, 360, 432, 518, 621, ...

use std::time::Duration;

use crate::config::ConnectionConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        Self { min, max, jitter, current: min }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.min_backoff, config.max_backoff, config.jitter)
    }

    /// Delay the next scheduled attempt will wait.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Return the delay to wait now and grow the following one.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.grow(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Adopt new bounds without losing the escalation reached so far.
    pub fn reconfigure(&mut self, config: &ConnectionConfig) {
        self.min = config.min_backoff;
        self.max = config.max_backoff;
        self.jitter = config.jitter;
        self.current = self.current.clamp(self.min, self.max);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    fn grow(&self, from: Duration) -> Duration {
        let scaled = (from.as_millis() as f64 * self.jitter).floor();
        let max_ms = self.max.as_millis() as f64;
        if scaled >= max_ms {
            return self.max;
        }
        Duration::from_millis(scaled as u64).max(from)
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
