//! reqwest-backed transport and OAuth client-credentials tokens

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::transport::{
    ChannelRequest, ChannelResponse, ChannelTransport, HttpMethod, TokenProvider,
};
use super::ChannelError;
use crate::util::compact_text;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ChannelError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !crate::util::is_http_url(&base_url) {
            return Err(ChannelError::InvalidPayload(format!(
                "channel base URL must start with http:// or https://, got `{base_url}`"
            )));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| ChannelError::Connection(sanitize(&error)))?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn send(
        &self,
        request: &ChannelRequest,
        token: &str,
    ) -> Result<ChannelResponse, ChannelError> {
        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(map_send_error)?;

        Ok(ChannelResponse {
            status,
            body: parse_body(&text),
            retry_after,
        })
    }
}

fn map_send_error(error: reqwest::Error) -> ChannelError {
    if error.is_timeout() {
        ChannelError::Timeout(Duration::ZERO)
    } else {
        ChannelError::Connection(sanitize(&error))
    }
}

/// JSON bodies parse as JSON; anything else is kept as a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(compact_text(text)))
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

/// Client-credentials token source with an in-memory cache
pub struct ClientCredentialsTokens {
    token_url: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
    cached: RwLock<Option<String>>,
}

impl std::fmt::Debug for ClientCredentialsTokens {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientCredentialsTokens")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token: Option<String>,
}

impl ClientCredentialsTokens {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|error| ChannelError::Connection(sanitize(&error)))?;
        Ok(Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client,
            cached: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<String, ChannelError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => ChannelError::Unauthorized(compact_text(&body)),
                500..=599 => ChannelError::Server {
                    status,
                    message: compact_text(&body),
                },
                _ => ChannelError::Client {
                    status,
                    message: compact_text(&body),
                },
            });
        }

        let payload = response
            .json::<TokenResponse>()
            .await
            .map_err(|error| ChannelError::InvalidPayload(sanitize(&error)))?;
        payload
            .access_token
            .or(payload.token)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ChannelError::InvalidPayload("token response had no access_token".to_string())
            })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokens {
    async fn token(&self) -> Result<String, ChannelError> {
        if let Some(token) = self.cached.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, ChannelError> {
        let mut cached = self.cached.write().await;
        let token = self.fetch().await?;
        *cached = Some(token.clone());
        tracing::debug!("Refreshed channel access token");
        Ok(token)
    }
}
