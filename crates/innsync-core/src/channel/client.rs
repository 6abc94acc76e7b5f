//! Resilient channel client: `call(operation, payload) -> body | ChannelError`

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use super::rate_limit::{RateLimiter, RateLimiterSnapshot};
use super::retry::BackoffPolicy;
use super::transport::{
    ChannelOperation, ChannelRequest, ChannelResponse, ChannelTransport, OperationRouter,
    TokenProvider,
};
use super::ChannelError;
use crate::config::SyncSettings;
use crate::util::compact_text;

/// Live resilience counters, served by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelHealth {
    pub circuit: CircuitSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
}

pub struct ChannelClient {
    transport: Arc<dyn ChannelTransport>,
    tokens: Arc<dyn TokenProvider>,
    router: Arc<dyn OperationRouter>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    request_timeout: Duration,
    backoff: BackoffPolicy,
}

impl ChannelClient {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        tokens: Arc<dyn TokenProvider>,
        router: Arc<dyn OperationRouter>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            transport,
            tokens,
            router,
            limiter: RateLimiter::new(
                settings.rate_limit_per_window,
                settings.rate_limit_window,
                settings.rate_limit_max_wait,
            ),
            breaker: CircuitBreaker::new(
                settings.circuit_failure_threshold,
                settings.circuit_cooldown,
            ),
            request_timeout: settings.request_timeout,
            backoff: BackoffPolicy::new(
                Duration::from_millis(500),
                Duration::from_secs(30),
                settings.http_max_attempts,
            ),
        }
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn health(&self) -> ChannelHealth {
        ChannelHealth {
            circuit: self.breaker.snapshot(),
            rate_limiter: self.limiter.snapshot(),
        }
    }

    /// Perform one logical operation.
    ///
    /// Partner failures are retried with exponential backoff up to the
    /// configured attempt count. An auth rejection gets one token refresh and
    /// one more try. Everything else is returned as is.
    pub async fn call(
        &self,
        operation: &ChannelOperation,
        payload: Option<Value>,
    ) -> Result<Value, ChannelError> {
        let request = self.router.route(operation, payload);
        let mut attempts = 0_u32;
        let mut refreshed = false;

        loop {
            attempts += 1;
            match self.attempt(&request).await {
                Ok(body) => {
                    tracing::debug!(
                        operation = operation.name(),
                        attempt = attempts,
                        "Channel call succeeded"
                    );
                    return Ok(body);
                }
                Err(ChannelError::Unauthorized(message)) if !refreshed => {
                    refreshed = true;
                    attempts -= 1;
                    tracing::warn!(
                        operation = operation.name(),
                        error = %message,
                        "Channel rejected token, refreshing once"
                    );
                    self.tokens.refresh().await?;
                }
                Err(error)
                    if error.is_partner_failure() && self.backoff.allows_another(attempts) =>
                {
                    let mut delay = self.backoff.delay_for(attempts - 1);
                    if let ChannelError::RateLimited {
                        retry_after: Some(after),
                    } = &error
                    {
                        delay = delay.max(*after).min(self.backoff.max_delay);
                    }
                    tracing::warn!(
                        operation = operation.name(),
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Retrying channel call after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::debug!(
                        operation = operation.name(),
                        attempt = attempts,
                        error = %error,
                        "Channel call failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// One dispatch through the breaker, the limiter and the timeout
    async fn attempt(&self, request: &ChannelRequest) -> Result<Value, ChannelError> {
        let permit = self.breaker.try_acquire()?;

        if let Err(error) = self.limiter.acquire().await {
            self.breaker.release(permit);
            return Err(error);
        }
        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(error) => {
                self.breaker.release(permit);
                return Err(error);
            }
        };

        let outcome =
            match tokio::time::timeout(self.request_timeout, self.transport.send(request, &token))
                .await
            {
                Err(_) | Ok(Err(ChannelError::Timeout(_))) => {
                    Err(ChannelError::Timeout(self.request_timeout))
                }
                Ok(Err(error)) => Err(error),
                Ok(Ok(response)) => classify(response),
            };

        match &outcome {
            Err(error) if error.is_partner_failure() => self.breaker.on_failure(permit),
            _ => self.breaker.on_success(permit),
        }
        outcome
    }
}

/// Turn an HTTP status into the failure taxonomy
fn classify(response: ChannelResponse) -> Result<Value, ChannelError> {
    let status = response.status;
    match status {
        200..=299 => Ok(response.body),
        401 | 403 => Err(ChannelError::Unauthorized(error_message(&response.body))),
        429 => Err(ChannelError::RateLimited {
            retry_after: response.retry_after,
        }),
        500..=599 => Err(ChannelError::Server {
            status,
            message: error_message(&response.body),
        }),
        _ => Err(ChannelError::Client {
            status,
            message: error_message(&response.body),
        }),
    }
}

fn error_message(body: &Value) -> String {
    let message = ["message", "error", "detail"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(ToString::to_string);
    match (message, body) {
        (Some(message), _) => compact_text(&message),
        (None, Value::String(text)) => compact_text(text),
        (None, Value::Null) => String::new(),
        (None, other) => compact_text(&other.to_string()),
    }
}
