//! Channel API failure taxonomy

use std::time::Duration;

use thiserror::Error;

/// How a failure is handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff up to a bound
    Transient,
    /// One token refresh and retry, then surfaced
    Authentication,
    /// The single item is skipped and the run continues
    Validation,
    /// Fast-failed without a network call
    CircuitOpen,
}

/// Errors returned by the channel client
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Channel request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel connection failed: {0}")]
    Connection(String),

    #[error("Channel server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Channel rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Channel rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Channel rejected request {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Invalid channel payload: {0}")]
    InvalidPayload(String),

    #[error("Skipped: partner unavailable (circuit open)")]
    CircuitOpen,

    #[error("No rate-limit token within {0:?}")]
    Throttled(Duration),
}

impl ChannelError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_)
            | Self::Connection(_)
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Throttled(_) => ErrorKind::Transient,
            Self::Unauthorized(_) => ErrorKind::Authentication,
            Self::Client { .. } | Self::InvalidPayload(_) => ErrorKind::Validation,
            Self::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }

    /// Whether retrying later may succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::CircuitOpen)
    }

    /// Failures attributable to the partner; these feed the circuit breaker
    /// and are retried inside a single call.
    pub const fn is_partner_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::Server { .. } | Self::RateLimited { .. }
        )
    }

    /// Whether a run that hits this error cannot usefully continue with other items
    pub const fn aborts_run(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        assert_eq!(
            ChannelError::Server {
                status: 503,
                message: String::new()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ChannelError::Unauthorized("expired".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            ChannelError::Client {
                status: 422,
                message: String::new()
            }
            .kind(),
            ErrorKind::Validation
        );
        assert!(!ChannelError::CircuitOpen.is_partner_failure());
        assert!(!ChannelError::Throttled(Duration::ZERO).is_partner_failure());
        assert!(ChannelError::RateLimited { retry_after: None }.is_partner_failure());
        assert!(!ChannelError::InvalidPayload("x".into()).aborts_run());
        assert!(ChannelError::CircuitOpen.aborts_run());
    }

    #[test]
    fn circuit_open_message_reads_as_skip() {
        assert!(ChannelError::CircuitOpen
            .to_string()
            .contains("partner unavailable"));
    }
}
