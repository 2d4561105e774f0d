/// Stateful exponential backoff for long-running loops
///
/// Unlike [`crate::retry::with_retry`], which wraps a single operation, this
/// tracks consecutive failures of a loop that never gives up (e.g. a consumer
/// reconnecting to the broker). Call [`ExponentialBackoff::reset`] after a
/// successful iteration.
use crate::retry::{calculate_backoff, next_backoff, RetryConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    current: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    /// `max_retries` is ignored; the loop decides when to stop.
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_backoff;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt. Advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = calculate_backoff(self.current, self.config.jitter);
        self.failures = self.failures.saturating_add(1);
        self.current = next_backoff(
            self.current,
            self.config.backoff_multiplier,
            self.config.max_backoff,
        );
        delay
    }

    /// Number of consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_delays_grow_until_cap() {
        let mut backoff = ExponentialBackoff::new(config());

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.failures(), 4);
    }

    #[test]
    fn test_reset_restarts_from_initial_delay() {
        let mut backoff = ExponentialBackoff::new(config());
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
