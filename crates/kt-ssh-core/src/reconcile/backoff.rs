//! Exponential backoff for reconnection (§4.5.2)
//!
//! No jitter: §8 pins the sequence for N attempts to exactly
//! `1, 2, 4, 8, 16, 16, ...` (with the default `BackoffConfig`), so unlike
//! the teacher's agent-side connector this does not randomize the delay.

use std::time::Duration;

use kt_core::config::BackoffConfig;

/// Doubling backoff, capped at a maximum delay.
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Build a backoff from configuration.
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier,
        }
    }

    /// Get the next delay and advance the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_matches_spec_defaults() {
        let mut backoff = Backoff::from_config(&BackoffConfig::default());
        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn stays_capped_once_max_is_reached() {
        let mut backoff = Backoff::from_config(&BackoffConfig::default());
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
    }
}
