//! Retry delays for failed attempts

use rand::Rng;

use crate::config::QueueConfig;

/// Exponential backoff with proportional jitter
///
/// The delay after attempt `n` (1-based) is `base * 2^(n-1)`, capped at `max`,
/// plus a random extra in `[0, delay * jitter_ratio)`. With a ratio below 1 the
/// jittered delay for attempt `n` always stays under the unjittered delay for
/// `n + 1`, so delays grow strictly until the cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_secs: i64,
    pub max_secs: i64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_secs: config.backoff_base_secs,
            max_secs: config.backoff_max_secs,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before the next try, without jitter
    pub fn base_delay(&self, attempt: u32) -> i64 {
        let exponent = attempt.saturating_sub(1).min(62);
        self.base_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_secs)
    }

    pub fn delay(&self, attempt: u32) -> i64 {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> i64 {
        let base = self.base_delay(attempt);
        let spread = (base as f64 * self.jitter_ratio) as i64;
        if spread <= 0 {
            return base;
        }
        base + rng.gen_range(0..spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_secs: 30,
            max_secs: 3600,
            jitter_ratio: 0.5,
        }
    }

    #[test]
    fn test_base_delay_doubles_then_caps() {
        let policy = policy();
        let delays: Vec<i64> = (1..=9).map(|n| policy.base_delay(n)).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 960, 1920, 3600, 3600]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = policy();
        for _ in 0..200 {
            let d = policy.delay(2);
            assert!((60..90).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_jittered_delays_strictly_increase_before_cap() {
        let policy = policy();
        for _ in 0..50 {
            let mut previous = 0;
            for attempt in 1..=7 {
                let d = policy.delay(attempt);
                assert!(d > previous);
                previous = d;
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..policy()
        };
        assert_eq!(policy.delay(3), 120);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(policy().base_delay(u32::MAX), 3600);
    }
}
