//! Capped exponential backoff with uniform jitter for same-provider
//! retries: `delay = min(base * 2^attempt + uniform(0, jitter), cap)`.

use rand::Rng;
use std::time::Duration;

/// Retry pacing policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackoffPolicy {
    /// First-retry base delay
    pub base: Duration,
    /// Upper bound of the random jitter added to each delay
    pub jitter: Duration,
    /// Ceiling for any single delay
    pub cap: Duration,
    /// Maximum same-provider retries per request
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            jitter: Duration::from_millis(200),
            cap: Duration::from_secs(2),
            max_retries: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        std::cmp::min(exp + Duration::from_millis(jitter_ms), self.cap)
    }

    /// Whether a retry is worth attempting given the time left: the delay
    /// plus one more base-sized attempt has to fit inside the budget.
    pub fn fits_within(&self, attempt: u32, remaining: Duration) -> bool {
        self.delay_for(attempt) + self.base <= remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_capped() {
        let policy = BackoffPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn tight_budget_disables_retry() {
        let policy = BackoffPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert!(policy.fits_within(0, Duration::from_secs(1)));
        assert!(!policy.fits_within(0, Duration::from_millis(300)));
    }
}
