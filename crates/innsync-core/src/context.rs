//! Process-level wiring of the sync services.
//!
//! [`SyncContext`] owns the background workers (outbound shards, webhook
//! processor, scheduler) and is the single entry point the API and CLI use.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelHealth, OperationRouter};
use crate::mapper::{ChannelMapper, GenericMapper, GenericRouter};
use crate::models::{ChangeEvent, ConflictId, DeadLetterId, RunId, SyncType};
use crate::services::SyncStore;
use crate::sync::{
    execute_run, pair_status, resolve_conflict, spawn_webhook_processor, start_manual,
    OutboundJob, OutboundQueue, PairStatus, ResolutionReport, ResolutionRequest, Scheduler,
    SyncEnv, WebhookIntake,
};
use crate::{Error, Result};

/// Webhook ids buffered between intake and the processor
const WEBHOOK_BUFFER: usize = 1_024;

/// Wire schema and URL layout of the partner API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelProvider {
    #[default]
    Generic,
}

impl ChannelProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
        }
    }

    pub fn mapper(self) -> Arc<dyn ChannelMapper> {
        match self {
            Self::Generic => Arc::new(GenericMapper),
        }
    }

    pub fn router(self) -> Arc<dyn OperationRouter> {
        match self {
            Self::Generic => Arc::new(GenericRouter),
        }
    }
}

impl FromStr for ChannelProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "generic" => Ok(Self::Generic),
            other => Err(Error::Config(format!("unknown channel provider `{other}`"))),
        }
    }
}

impl std::fmt::Display for ChannelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SyncContext {
    env: SyncEnv,
    outbound: OutboundQueue,
    webhooks: WebhookIntake,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("outbound", &self.outbound)
            .field("webhooks", &self.webhooks)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    /// Start the outbound workers and the webhook processor.
    ///
    /// The scheduler is started separately with [`SyncContext::spawn_scheduler`]
    /// so one-shot tools can use the context without periodic pulls.
    pub fn start(env: SyncEnv, webhook_secret: &[u8]) -> Self {
        let (outbound, mut tasks) = OutboundQueue::start(env.clone());
        let (tx, rx) = mpsc::channel(WEBHOOK_BUFFER);
        let webhooks = WebhookIntake::new(&env, webhook_secret, tx);
        tasks.push(spawn_webhook_processor(env.clone(), rx));
        Self {
            env,
            outbound,
            webhooks,
            tasks,
        }
    }

    pub fn spawn_scheduler(&mut self) {
        self.tasks.push(self.scheduler().spawn());
    }

    pub const fn env(&self) -> &SyncEnv {
        &self.env
    }

    pub const fn store(&self) -> &SyncStore {
        &self.env.store
    }

    pub const fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub const fn webhooks(&self) -> &WebhookIntake {
        &self.webhooks
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.env.clone())
    }

    pub fn health(&self) -> ChannelHealth {
        self.env.channel.health()
    }

    /// Start an operator run in the background. `None` when one is in flight.
    pub async fn trigger(&self, property_id: &str, sync_type: SyncType) -> Result<Option<RunId>> {
        let Some(lease) = start_manual(&self.env, property_id, sync_type).await? else {
            return Ok(None);
        };
        let run_id = lease.run.id;
        let env = self.env.clone();
        tokio::spawn(async move {
            if let Err(error) = execute_run(&env, lease).await {
                tracing::error!(run_id = %run_id, error = %error, "Manual sync errored");
            }
        });
        Ok(Some(run_id))
    }

    /// Queue a PMS change event. `false` when its flow is disabled.
    pub fn submit_change(&self, event: ChangeEvent) -> Result<bool> {
        self.env.external_property_id(&event.property_id)?;
        self.outbound.submit(event)
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        request: &ResolutionRequest,
    ) -> Result<ResolutionReport> {
        resolve_conflict(&self.env, id, request).await
    }

    /// Put a dead-lettered job back on its shard
    pub async fn replay_dead_letter(&self, id: &DeadLetterId) -> Result<()> {
        let letter = self
            .store()
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
        if letter.replayed_at.is_some() {
            return Err(Error::InvalidInput(format!(
                "dead letter {id} was already replayed"
            )));
        }
        self.outbound.enqueue(OutboundJob {
            event: letter.event,
            replay_of: Some(letter.id),
        })?;
        tracing::info!(dead_letter = %id, "Dead letter re-enqueued");
        Ok(())
    }

    pub async fn status(&self, property_id: &str) -> Result<Vec<PairStatus>> {
        pair_status(&self.env, property_id).await
    }

    /// Stop every background task
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("Sync context stopped");
    }
}
