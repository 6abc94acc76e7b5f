//! Seams between the resilient client and the wire

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// One HTTP call against the channel API, relative to its base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Sent as `Idempotency-Key`; repeats of the same create carry the same key
    pub idempotency_key: Option<String>,
}

impl ChannelRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

/// Raw answer; status classification happens in the client
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResponse {
    pub status: u16,
    pub body: Value,
    pub retry_after: Option<Duration>,
}

impl ChannelResponse {
    pub const fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }
}

/// Sends a request. Only network-level failures are errors here; every HTTP
/// status comes back as a response.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, request: &ChannelRequest, token: &str)
        -> Result<ChannelResponse, ChannelError>;
}

/// Access-token source for the channel API
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, fetched on first use
    async fn token(&self) -> Result<String, ChannelError>;

    /// Discard the cached token and fetch a new one
    async fn refresh(&self) -> Result<String, ChannelError>;
}

/// Fixed token, for API-key style partners and tests
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&"[REDACTED]").finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, ChannelError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, ChannelError> {
        Ok(self.0.clone())
    }
}

/// Logical operations the engine performs against a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOperation {
    /// Create when `external_id` is `None`, otherwise update
    PushReservation {
        external_property_id: String,
        external_id: Option<String>,
        idempotency_key: Option<String>,
    },
    CancelReservation {
        external_property_id: String,
        external_id: String,
    },
    PushAvailability {
        external_property_id: String,
    },
    PushRates {
        external_property_id: String,
    },
    FetchReservations {
        external_property_id: String,
        cursor: Option<String>,
        page_size: u32,
    },
    FetchReservation {
        external_property_id: String,
        external_id: String,
    },
    FetchGuests {
        external_property_id: String,
        cursor: Option<String>,
        page_size: u32,
    },
}

impl ChannelOperation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PushReservation {
                external_id: None, ..
            } => "create_reservation",
            Self::PushReservation { .. } => "update_reservation",
            Self::CancelReservation { .. } => "cancel_reservation",
            Self::PushAvailability { .. } => "push_availability",
            Self::PushRates { .. } => "push_rates",
            Self::FetchReservations { .. } => "fetch_reservations",
            Self::FetchReservation { .. } => "fetch_reservation",
            Self::FetchGuests { .. } => "fetch_guests",
        }
    }
}

/// Maps logical operations onto a partner's URL layout
pub trait OperationRouter: Send + Sync {
    fn route(&self, operation: &ChannelOperation, payload: Option<Value>) -> ChannelRequest;
}
