//! Reconnect backoff calculation.
//!
//! Pure math only; the transport owns the timers.
//!
//! - [`BackoffPolicy`]: attempt cap, exponential base/cap, jitter bounds
//! - [`BackoffPolicy::base_delay`]: `min(base * 2^(attempt-1), cap)`
//! - [`BackoffPolicy::jittered_delay`]: base delay scaled by a uniform
//!   factor in `[jitter_min, jitter_max]`

use std::time::Duration;

use rand::Rng;

/// Default reconnect attempts before settling into `disconnected`.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Default delay for the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default ceiling for a single reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default lower jitter bound.
pub const DEFAULT_JITTER_MIN: f64 = 0.75;
/// Default upper jitter bound.
pub const DEFAULT_JITTER_MAX: f64 = 1.25;

/// Exponential backoff with multiplicative jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Consecutive failed attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay for attempt 1.
    pub base_delay: Duration,
    /// Upper bound before jitter.
    pub max_delay: Duration,
    /// Smallest jitter multiplier.
    pub jitter_min: f64,
    /// Largest jitter multiplier.
    pub jitter_max: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Pre-jitter delay for a 1-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Scale a delay by `factor`, clamped into the jitter bounds.
    pub fn apply_jitter(&self, delay: Duration, factor: f64) -> Duration {
        let (lo, hi) = self.jitter_bounds();
        delay.mul_f64(factor.clamp(lo, hi))
    }

    /// Delay for a 1-based attempt with a random jitter factor.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let (lo, hi) = self.jitter_bounds();
        let factor = if hi > lo {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        self.apply_jitter(self.base_delay(attempt), factor)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    fn jitter_bounds(&self) -> (f64, f64) {
        let lo = self.jitter_min.max(0.0);
        (lo, self.jitter_max.max(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let secs: Vec<u64> = (1..=10).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn base_delay_matches_closed_form() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=10u32 {
            let expected = (1u64 << (attempt - 1)).min(30);
            assert_eq!(policy.base_delay(attempt), Duration::from_secs(expected));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=10u32 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let d = policy.jittered_delay(attempt);
                assert!(d >= base.mul_f64(0.75), "{d:?} below bound for {base:?}");
                assert!(d <= base.mul_f64(1.25), "{d:?} above bound for {base:?}");
            }
        }
    }

    #[test]
    fn apply_jitter_clamps_factor() {
        let policy = BackoffPolicy::default();
        let base = Duration::from_secs(4);
        assert_eq!(policy.apply_jitter(base, 0.1), Duration::from_secs(3));
        assert_eq!(policy.apply_jitter(base, 9.0), Duration::from_secs(5));
    }

    #[test]
    fn allows_up_to_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows(10));
        assert!(!policy.allows(11));
    }
}
