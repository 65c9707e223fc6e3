//! Exponential backoff for scan and listener errors.

use std::time::Duration;

/// Retry delay policy: `initial`, multiplied by `factor` per consecutive
/// failure, never above `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Returns the delay to wait after `consecutive_failures` failures in a row.
    ///
    /// Zero failures means no delay; the first failure waits `initial`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(64) as i32;
        let nanos = self.initial.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Consecutive-failure counter over a `BackoffConfig`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for(self.failures)
    }

    /// Forgets previous failures after a successful attempt.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let config = BackoffConfig::default();

        assert_eq!(config.delay_for(0), Duration::ZERO);
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = BackoffConfig::default();

        // 100ms * 2^9 = 51.2s
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_custom_config() {
        let config = BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            factor: 3.0,
        };

        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(3));
        assert_eq!(config.delay_for(3), Duration::from_secs(5));
    }
}
