//! Jittered exponential backoff, grounded in the wider example pack's
//! `slb350-open-agent-sdk-rust::retry::RetryConfig` — the chosen teacher crate has no
//! retry module of its own, so this is built in its idiom from that sibling.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Exponential delay for `attempt` (0-indexed), multiplied by `1 +/- jitter_factor`,
    /// capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_respects_cap() {
        let config = RetryConfig::default();
        let first = config.calculate_delay(0);
        let third = config.calculate_delay(5);
        assert!(first <= config.max_delay);
        assert!(third <= config.max_delay);
    }
}
