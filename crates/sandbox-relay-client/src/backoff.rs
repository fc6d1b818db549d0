//! Exponential reconnect delays.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First delay after a failure.
    pub initial: Duration,
    /// Ceiling for the doubled delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff: starts at `initial`, doubles per failure, capped at
/// `max`, reset to `initial` on any successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    /// Create a backoff at its initial delay.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            next: config.initial,
        }
    }

    /// Delay to wait before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.config.max);
        delay
    }

    /// Reset to the initial delay after a successful open.
    pub fn reset(&mut self) {
        self.next = self.config.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        let mut backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
