//! Reconnect policy: capped exponential backoff with a fixed attempt budget.

use std::time::Duration;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Ceiling for any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
/// Attempts per (re)connection before the session is declared failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// How long to wait between connection attempts, and how many to make.
///
/// Delays double from `base_delay` and are capped at `max_delay`:
/// with the defaults, 0.5s, 1s, 2s, 4s, 8s, 8s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether `attempts_made` consumed the whole budget.
    #[must_use]
    pub const fn exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|n| u64::try_from(policy.delay_for(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, [500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[test]
    fn test_huge_retry_stays_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(64), DEFAULT_MAX_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_budget() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(5));
        assert!(policy.exhausted(6));
    }
}
