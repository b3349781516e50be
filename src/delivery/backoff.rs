//! Retry policy with capped exponential backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::DeliveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt before dead-lettering
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Whether an event that has failed `retry_count` times is out of retries
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    /// Upper bound of the delay before retry number `retry` (1-based):
    /// `base * 2^(retry - 1)`, capped at `max_delay`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry number `retry`, jittered uniformly over the upper
    /// half of [`Self::ceiling`].
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(retry);
        let half = ceiling / 2;
        let jitter_ms = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }

    #[test]
    fn test_ceiling_doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.ceiling(1), Duration::from_millis(1000));
        assert_eq!(policy.ceiling(2), Duration::from_millis(2000));
        assert_eq!(policy.ceiling(4), Duration::from_millis(8000));
        assert_eq!(policy.ceiling(5), Duration::from_millis(10_000));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_delay_stays_in_upper_half() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..8 {
            let ceiling = policy.ceiling(retry);
            for _ in 0..50 {
                let delay = policy.delay(retry, &mut rng);
                assert!(delay >= ceiling / 2, "{:?} below half of {:?}", delay, ceiling);
                assert!(delay <= ceiling, "{:?} above {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn test_exhausted_after_max_retries() {
        let policy = policy();
        assert!(!policy.exhausted(1));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&DeliveryConfig::default());
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
    }
}
