//! Outbound call rate limiter.
//!
//! A token bucket of `capacity` tokens where every spent token refills exactly
//! one `window` after it was spent. Dispatch times are kept in a queue, which
//! makes the bound exact: no rolling window of length `window` ever contains
//! more than `capacity` dispatches. Callers wait for a token up to `max_wait`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterSnapshot {
    pub capacity: u32,
    pub window_secs: u64,
    pub in_window: usize,
    pub dispatched_total: u64,
    pub waited_total: u64,
    pub throttled_total: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    max_wait: Duration,
    dispatched: Mutex<VecDeque<Instant>>,
    dispatched_total: AtomicU64,
    waited_total: AtomicU64,
    throttled_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration, max_wait: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            max_wait,
            dispatched: Mutex::new(VecDeque::new()),
            dispatched_total: AtomicU64::new(0),
            waited_total: AtomicU64::new(0),
            throttled_total: AtomicU64::new(0),
        }
    }

    /// Take a token, sleeping until one refills. Fails with `Throttled` when
    /// the next token would only be available after `max_wait`.
    pub async fn acquire(&self) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.max_wait;
        let mut waited = false;

        loop {
            let now = Instant::now();
            let wait = match self.try_take(now) {
                None => {
                    if waited {
                        self.waited_total.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Some(wait) => wait,
            };

            if now + wait > deadline {
                self.throttled_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Channel rate limit exhausted"
                );
                return Err(ChannelError::Throttled(self.max_wait));
            }

            waited = true;
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a dispatch at `now` if a token is free, else return the time
    /// until the oldest token refills.
    fn try_take(&self, now: Instant) -> Option<Duration> {
        let mut dispatched = match self.dispatched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while dispatched
            .front()
            .is_some_and(|spent| *spent + self.window <= now)
        {
            dispatched.pop_front();
        }

        if dispatched.len() < self.capacity as usize {
            dispatched.push_back(now);
            self.dispatched_total.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        dispatched
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let in_window = match self.dispatched.lock() {
            Ok(guard) => guard.iter().filter(|spent| **spent + self.window > now).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|spent| **spent + self.window > now)
                .count(),
        };
        RateLimiterSnapshot {
            capacity: self.capacity,
            window_secs: self.window.as_secs(),
            in_window,
            dispatched_total: self.dispatched_total.load(Ordering::Relaxed),
            waited_total: self.waited_total.load(Ordering::Relaxed),
            throttled_total: self.throttled_total.load(Ordering::Relaxed),
        }
    }
}
