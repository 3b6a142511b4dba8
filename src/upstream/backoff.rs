//! Restart backoff for upstream reconnection.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// `delay = random(0 ..= base × 2^min(retries, 6))`
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
}

impl RestartBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Upper bound of the delay window for the given retry count.
    pub fn ceiling(&self, retries: u32) -> Duration {
        let factor = 2u64.saturating_pow(retries.min(6));
        Duration::from_millis((self.base.as_millis() as u64).saturating_mul(factor))
    }

    /// Jittered delay for the given retry count.
    pub fn delay(&self, retries: u32) -> Duration {
        let ceiling = self.ceiling(retries).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let backoff = RestartBackoff::new(Duration::from_millis(500));
        assert_eq!(backoff.ceiling(0), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(4_000));
        assert_eq!(backoff.ceiling(6), Duration::from_millis(32_000));
        // Exponent caps at 6.
        assert_eq!(backoff.ceiling(7), Duration::from_millis(32_000));
        assert_eq!(backoff.ceiling(60), Duration::from_millis(32_000));
    }

    #[test]
    fn test_delay_stays_within_window() {
        let backoff = RestartBackoff::new(Duration::from_millis(100));
        for retries in 0..8 {
            let ceiling = backoff.ceiling(retries);
            for _ in 0..32 {
                assert!(backoff.delay(retries) <= ceiling);
            }
        }
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let backoff = RestartBackoff::new(Duration::ZERO);
        assert_eq!(backoff.delay(4), Duration::ZERO);
    }
}
