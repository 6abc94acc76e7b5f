//! In-process test doubles for the channel seams

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::transport::{
    ChannelOperation, ChannelRequest, ChannelResponse, ChannelTransport, HttpMethod,
    OperationRouter, TokenProvider,
};
use super::ChannelError;

type Handler = dyn Fn(&ChannelRequest) -> Result<ChannelResponse, ChannelError> + Send + Sync;

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub at: Instant,
    pub request: ChannelRequest,
    pub token: String,
}

/// Transport that answers from a script.
///
/// Queued answers are used first, then the handler, then the fallback
/// response (200 with an empty object unless configured).
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<ChannelResponse, ChannelError>>>,
    handler: Option<Arc<Handler>>,
    fallback: ChannelResponse,
    latency: Duration,
    sent: Mutex<Vec<SentRequest>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: None,
            fallback: ChannelResponse::new(200, serde_json::json!({})),
            latency: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, status: u16, body: Value) -> Self {
        self.fallback = ChannelResponse::new(status, body);
        self
    }

    #[must_use]
    pub fn with_handler(
        mut self,
        handler: impl Fn(&ChannelRequest) -> Result<ChannelResponse, ChannelError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_status(&self, status: u16, body: Value) {
        lock(&self.queue).push_back(Ok(ChannelResponse::new(status, body)));
    }

    pub fn requests(&self) -> Vec<ChannelRequest> {
        lock(&self.sent).iter().map(|sent| sent.request.clone()).collect()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        lock(&self.sent).iter().map(|sent| sent.at).collect()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|sent| sent.token.clone()).collect()
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &ChannelRequest,
        token: &str,
    ) -> Result<ChannelResponse, ChannelError> {
        lock(&self.sent).push(SentRequest {
            at: Instant::now(),
            request: request.clone(),
            token: token.to_string(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let queued = lock(&self.queue).pop_front();
        if let Some(answer) = queued {
            return answer;
        }
        if let Some(handler) = &self.handler {
            return handler(request);
        }
        Ok(self.fallback.clone())
    }
}

/// Token source that hands out `token-N`, bumping N on each refresh
#[derive(Debug, Default)]
pub struct CountingTokens {
    refreshes: AtomicU32,
}

impl CountingTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn token(&self) -> Result<String, ChannelError> {
        Ok(format!("token-{}", self.refreshes()))
    }

    async fn refresh(&self) -> Result<String, ChannelError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{n}"))
    }
}

/// Routes every operation to `POST /<operation name>`
#[derive(Debug, Default, Clone, Copy)]
pub struct OperationNameRouter;

impl OperationRouter for OperationNameRouter {
    fn route(&self, operation: &ChannelOperation, payload: Option<Value>) -> ChannelRequest {
        ChannelRequest::new(HttpMethod::Post, format!("/{}", operation.name())).with_body(payload)
    }
}
