//! Resilient access to a channel manager API.
//!
//! Every call passes the circuit breaker, then the rate limiter, then a hard
//! timeout. Only partner failures are retried.

mod circuit_breaker;
mod client;
mod error;
mod http;
mod rate_limit;
mod retry;
pub mod testing;
mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, Permit};
pub use client::{ChannelClient, ChannelHealth};
pub use error::{ChannelError, ErrorKind};
pub use http::{ClientCredentialsTokens, HttpTransport};
pub use rate_limit::{RateLimiter, RateLimiterSnapshot};
pub use retry::BackoffPolicy;
pub use transport::{
    ChannelOperation, ChannelRequest, ChannelResponse, ChannelTransport, HttpMethod,
    OperationRouter, StaticToken, TokenProvider,
};
