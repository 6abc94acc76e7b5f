//! Exponential backoff schedule shared by channel calls, outbound redelivery
//! and failed-run rescheduling.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts including the first; retries are `max_attempts - 1`
    pub max_attempts: u32,
    /// Spread each delay over `[0.75, 1.25]` of its nominal value
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 4,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max_delay,
            max_attempts,
            jitter: false,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `retry` (0-based): `initial * multiplier^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nominal = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        let mut delay = if nominal.is_finite() { nominal.min(max) } else { max };
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.75..=1.25);
            delay = delay.min(max);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub const fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_then_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 10);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(60), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(4), Duration::from_secs(100), 5).with_jitter();
        for _ in 0..200 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(6) && delay <= Duration::from_secs(10));
        }
        for _ in 0..50 {
            assert!(policy.delay_for(30) <= Duration::from_secs(100));
        }
    }

    #[test]
    fn attempt_bound() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 3);
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
