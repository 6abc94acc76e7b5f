//! Circuit breaker around the channel API.
//!
//! `Closed` admits every call. `failure_threshold` consecutive partner failures
//! open the circuit; while open, calls fail fast. Once `cooldown` has elapsed
//! the next caller becomes the single half-open trial and its outcome alone
//! decides whether the circuit closes or reopens with a fresh cooldown.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single call admitted in half-open state
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ask to dispatch one call
    pub fn try_acquire(&self) -> Result<Permit, ChannelError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(ChannelError::CircuitOpen);
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!("Channel circuit half-open, admitting trial call");
                Ok(Permit::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(ChannelError::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    /// The partner answered
    pub fn on_success(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit == Permit::Normal && inner.state != CircuitState::Closed {
            // admitted before the circuit opened; only the trial may close it
            return;
        }
        if permit == Permit::Trial {
            tracing::info!("Channel circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// The partner failed (timeout, connection, 5xx, 429)
    pub fn on_failure(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit == Permit::Normal && inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if permit == Permit::Trial || inner.consecutive_failures >= self.failure_threshold {
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Channel circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }

    /// The permit was not used for a call; a trial slot becomes free again.
    pub fn release(&self, permit: Permit) {
        if permit == Permit::Trial {
            let mut inner = self.lock();
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            cooldown_secs: self.cooldown.as_secs(),
        }
    }
}
