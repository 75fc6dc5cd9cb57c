//! Retry backoff strategy shared by the relay and the broker's redelivery.

use std::time::Duration;

/// Exponential backoff with an attempt cap and optional jitter.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential growth.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to jitter delays to avoid thundering herds.
    pub use_jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Calculates the delay preceding the given 1-based retry attempt.
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.base_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = std::cmp::min(Duration::from_millis(delay_ms as u64), self.max_delay);

        if self.use_jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }
}

#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn add_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> RetryStrategy {
        RetryStrategy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let s = strategy();
        assert_eq!(s.delay_for(1), Duration::from_millis(100));
        assert_eq!(s.delay_for(2), Duration::from_millis(200));
        assert_eq!(s.delay_for(3), Duration::from_millis(400));
        assert_eq!(s.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(strategy().delay_for(0), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let s = RetryStrategy {
            use_jitter: true,
            ..strategy()
        };
        for _ in 0..100 {
            let delay = s.delay_for(1);
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}
