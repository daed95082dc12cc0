//! Reconnection backoff

use std::time::Duration;

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based); `None` once attempts are exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Counts consecutive failed connection attempts against a policy
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Register a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempts.saturating_add(1))?;
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .filter_map(|n| policy.delay_for(n))
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.delay_for(6), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_tracker_exhausts_and_resets() {
        let mut tracker = ReconnectTracker::new(ReconnectPolicy::default());
        for _ in 0..5 {
            assert!(tracker.next_delay().is_some());
        }
        assert_eq!(tracker.next_delay(), None);
        assert_eq!(tracker.attempts(), 5);

        tracker.reset();
        assert_eq!(tracker.next_delay(), Some(Duration::from_secs(1)));
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_policy(max_attempts in 0u32..20, failures in 0usize..50) {
            let mut tracker = ReconnectTracker::new(ReconnectPolicy {
                max_attempts,
                ..ReconnectPolicy::default()
            });
            let scheduled = (0..failures).filter(|_| tracker.next_delay().is_some()).count();
            prop_assert!(scheduled <= max_attempts as usize);
            prop_assert!(tracker.attempts() <= max_attempts);
        }

        #[test]
        fn delays_are_monotonic(attempt in 1u32..30) {
            let policy = ReconnectPolicy { max_attempts: 40, ..ReconnectPolicy::default() };
            let a = policy.delay_for(attempt);
            let b = policy.delay_for(attempt + 1);
            prop_assert!(a <= b);
        }
    }
}
