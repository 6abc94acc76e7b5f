//! Append-only sync log repository implementation

#![allow(clippy::cast_possible_wrap)]

use libsql::{Connection, Row, Value};

use super::row;
use super::schema::Persisted;
use crate::error::Result;
use crate::models::{EntityType, RunId, SyncLog};
use crate::util::to_millis;

/// Filters for reading the log, newest first
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub property_id: Option<String>,
    pub run_id: Option<RunId>,
    pub entity_type: Option<EntityType>,
    pub local_id: Option<String>,
    pub external_id: Option<String>,
    /// Only failed rows
    pub failures_only: bool,
    pub limit: usize,
}

/// Trait for sync log storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SyncLogRepository {
    async fn append(&self, log: &SyncLog) -> Result<()>;

    async fn list(&self, filter: &LogFilter) -> Result<Vec<SyncLog>>;
}

/// libSQL implementation of `SyncLogRepository`
pub struct LibSqlSyncLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<SyncLog> {
        Ok(SyncLog {
            id: row::parsed(row, 0)?,
            property_id: row::text(row, 1)?,
            run_id: row::opt_parsed(row, 2)?,
            operation: row::parsed(row, 3)?,
            direction: row::parsed(row, 4)?,
            entity_type: row::parsed(row, 5)?,
            local_id: row::opt_text(row, 6)?,
            external_id: row::opt_text(row, 7)?,
            success: row::flag(row, 8)?,
            conflict: row::flag(row, 9)?,
            duration_ms: row.get::<i64>(10)?,
            request: row::opt_json(row, 11)?,
            response: row::opt_json(row, 12)?,
            error: row::opt_text(row, 13)?,
            created_at: row::time(row, 14)?,
        })
    }
}

impl SyncLogRepository for LibSqlSyncLogRepository<'_> {
    async fn append(&self, log: &SyncLog) -> Result<()> {
        let request = log.request.as_ref().map(serde_json::to_string).transpose()?;
        let response = log.response.as_ref().map(serde_json::to_string).transpose()?;
        self.conn
            .execute(
                &SyncLog::insert_sql(),
                libsql::params![
                    log.id.as_str(),
                    log.property_id.clone(),
                    log.run_id.map(|id| id.as_str()),
                    log.operation.as_str(),
                    log.direction.as_str(),
                    log.entity_type.as_str(),
                    log.local_id.clone(),
                    log.external_id.clone(),
                    i64::from(log.success),
                    i64::from(log.conflict),
                    log.duration_ms,
                    request,
                    response,
                    log.error.clone(),
                    to_millis(log.created_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<SyncLog>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(property_id) = &filter.property_id {
            clauses.push("property_id = ?");
            params.push(property_id.clone().into());
        }
        if let Some(run_id) = filter.run_id {
            clauses.push("run_id = ?");
            params.push(run_id.as_str().into());
        }
        if let Some(entity_type) = filter.entity_type {
            clauses.push("entity_type = ?");
            params.push(entity_type.as_str().into());
        }
        if let Some(local_id) = &filter.local_id {
            clauses.push("local_id = ?");
            params.push(local_id.clone().into());
        }
        if let Some(external_id) = &filter.external_id {
            clauses.push("external_id = ?");
            params.push(external_id.clone().into());
        }
        if filter.failures_only {
            clauses.push("success = 0");
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        params.push((limit as i64).into());

        let sql = format!(
            "{}{where_sql} ORDER BY created_at DESC, id DESC LIMIT ?",
            SyncLog::select_sql()
        );
        let mut rows = self.conn.query(&sql, params).await?;
        let mut logs = Vec::new();
        while let Some(row) = rows.next().await? {
            logs.push(Self::parse(&row)?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Direction, SyncOperation};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn append_and_filter() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncLogRepository::new(db.connection());
        let run_id = RunId::new();

        let ok = SyncLog::new(
            "p1",
            Direction::Inbound,
            EntityType::Reservation,
            SyncOperation::Create,
        )
        .in_run(Some(run_id))
        .with_external_id(Some("BK-1"))
        .with_request(serde_json::json!({"id": "BK-1"}))
        .succeeded(Duration::from_millis(5));
        let failed = SyncLog::new(
            "p1",
            Direction::Inbound,
            EntityType::Reservation,
            SyncOperation::Update,
        )
        .in_run(Some(run_id))
        .with_external_id(Some("BK-2"))
        .failed("missing check_in", Duration::ZERO);

        repo.append(&ok).await.unwrap();
        repo.append(&failed).await.unwrap();

        let all = repo
            .list(&LogFilter {
                run_id: Some(run_id),
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let failures = repo
            .list(&LogFilter {
                property_id: Some("p1".to_string()),
                failures_only: true,
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("missing check_in"));

        let by_external = repo
            .list(&LogFilter {
                external_id: Some("BK-1".to_string()),
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(
            by_external[0].request,
            Some(serde_json::json!({"id": "BK-1"}))
        );
    }
}
