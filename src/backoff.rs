//! Reconnect delay policy.
//!
//! The policy computes exponential backoff with lightweight jitter for the
//! stream reconnect loop. Jitter avoids synchronized reconnect storms when
//! many clients lose the same upstream at once.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect attempts and exponential backoff growth.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Maximum number of automatic reconnect attempts before giving up.
    pub max_attempts: usize,
    /// Delay used before the first reconnect attempt.
    pub base_delay: Duration,
    /// Hard upper bound for any computed delay, jitter included.
    pub max_delay: Duration,
    /// Multiplicative growth factor applied per attempt.
    pub growth_factor: f64,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based. The delay is
    /// `base_delay * growth_factor^(attempt - 1)` plus jitter, and the sum is
    /// clamped so the result never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let base_ms = self.base_delay.as_millis() as f64 * factor;
        let grown = Duration::from_millis(base_ms.min(u64::MAX as f64) as u64);
        grown
            .saturating_add(jitter_duration(self.jitter, attempt))
            .min(self.max_delay)
    }

    /// True when the policy allows scheduling the given 1-based attempt.
    pub fn allows_attempt(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth_factor: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    fn policy_without_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            growth_factor: 2.0,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delays_grow_exponentially_from_base() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_never_exceeds_max_delay() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(50),
            ..policy_without_jitter()
        };
        for attempt in 1..=20 {
            assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn jitter_cannot_push_a_saturated_delay_past_max() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            jitter: Duration::from_millis(100),
        };
        for attempt in 1..=20 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn attempts_beyond_ceiling_are_rejected() {
        let policy = policy_without_jitter();
        assert!(policy.allows_attempt(5));
        assert!(!policy.allows_attempt(6));
    }

    #[test]
    fn growth_factor_below_one_is_treated_as_flat() {
        let policy = ReconnectPolicy {
            growth_factor: 0.5,
            ..policy_without_jitter()
        };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
    }
}
