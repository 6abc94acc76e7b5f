use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window limit on operator sync triggers, keyed by property and flow
#[derive(Clone)]
pub struct TriggerRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct RateLimitMetrics {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub allowed: u64,
    pub limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl TriggerRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.trigger_rate_limit_window,
            config.trigger_rate_limit_per_window,
        )
    }

    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, property_id: &str, sync_type: &str) -> Result<(), AppError> {
        let key = format!("{property_id}:{sync_type}");
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.metrics.limited.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                property_id,
                sync_type,
                retry_after_secs,
                "Trigger rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Too many sync triggers for this property",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = TriggerRateLimiter::new(Duration::from_secs(60), 2);

        limiter.check("p1", "reservations").await.unwrap();
        limiter.check("p1", "reservations").await.unwrap();

        let err = limiter.check("p1", "reservations").await.unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));

        // Other properties and flows have their own windows.
        limiter.check("p2", "reservations").await.unwrap();
        limiter.check("p1", "rates").await.unwrap();

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.allowed, 4);
        assert_eq!(metrics.limited, 1);
    }
}
