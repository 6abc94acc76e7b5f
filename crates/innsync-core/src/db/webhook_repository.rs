//! Webhook idempotency repository implementation

#![allow(clippy::cast_possible_wrap)]

use chrono::{DateTime, Duration, Utc};
use libsql::{Connection, Row};

use super::row;
use super::schema::Persisted;
use crate::error::Result;
use crate::models::WebhookEvent;
use crate::util::to_millis;

/// Trait for webhook event storage operations (async)
#[allow(async_fn_in_trait)]
pub trait WebhookEventRepository {
    /// Store the event unless its id is already known. Returns whether it was new.
    async fn insert_if_absent(&self, event: &WebhookEvent) -> Result<bool>;

    async fn get(&self, event_id: &str) -> Result<Option<WebhookEvent>>;

    /// Take the processing lease on an unprocessed event. Fails while another
    /// worker holds an unexpired lease.
    async fn claim(&self, event_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<bool>;

    /// Freeze the event as processed. Returns `false` if it already was.
    async fn mark_processed(&self, event_id: &str) -> Result<bool>;

    /// Record a failed processing attempt on an unprocessed event
    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool>;

    /// Unprocessed events, oldest first
    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<WebhookEvent>>;
}

/// libSQL implementation of `WebhookEventRepository`
pub struct LibSqlWebhookEventRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlWebhookEventRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<WebhookEvent> {
        Ok(WebhookEvent {
            event_id: row::text(row, 0)?,
            event_type: row::text(row, 1)?,
            payload: row::json(row, 2)?,
            processed: row::flag(row, 3)?,
            error: row::opt_text(row, 4)?,
            attempts: row::count(row, 5)?,
            received_at: row::time(row, 6)?,
            processed_at: row::opt_time(row, 7)?,
            claimed_until: row::opt_time(row, 8)?,
        })
    }
}

impl WebhookEventRepository for LibSqlWebhookEventRepository<'_> {
    async fn insert_if_absent(&self, event: &WebhookEvent) -> Result<bool> {
        let sql = WebhookEvent::insert_sql().replacen("INSERT INTO", "INSERT OR IGNORE INTO", 1);
        let inserted = self
            .conn
            .execute(
                &sql,
                libsql::params![
                    event.event_id.clone(),
                    event.event_type.clone(),
                    serde_json::to_string(&event.payload)?,
                    i64::from(event.processed),
                    event.error.clone(),
                    i64::from(event.attempts),
                    to_millis(event.received_at),
                    event.processed_at.map(to_millis),
                    event.claimed_until.map(to_millis),
                ],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn get(&self, event_id: &str) -> Result<Option<WebhookEvent>> {
        let sql = format!("{} WHERE event_id = ?", WebhookEvent::select_sql());
        let mut rows = self.conn.query(&sql, [event_id]).await?;
        match rows.next().await? {
            Some(row) => Self::parse(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn claim(&self, event_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE webhook_events SET claimed_until = ?
                 WHERE event_id = ? AND processed = 0
                   AND (claimed_until IS NULL OR claimed_until <= ?)",
                libsql::params![to_millis(now + lease), event_id, to_millis(now)],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE webhook_events
                 SET processed = 1, error = NULL, attempts = attempts + 1, processed_at = ?,
                     claimed_until = NULL
                 WHERE event_id = ? AND processed = 0",
                libsql::params![to_millis(Utc::now()), event_id],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE webhook_events
                 SET error = ?, attempts = attempts + 1, claimed_until = NULL
                 WHERE event_id = ? AND processed = 0",
                libsql::params![error, event_id],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<WebhookEvent>> {
        let sql = format!(
            "{} WHERE processed = 0 ORDER BY received_at ASC LIMIT ?",
            WebhookEvent::select_sql()
        );
        let limit = (if limit == 0 { 100 } else { limit }) as i64;
        let mut rows = self.conn.query(&sql, [limit]).await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(Self::parse(&row)?);
        }
        Ok(events)
    }
}
