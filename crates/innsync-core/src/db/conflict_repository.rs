//! Conflict queue repository implementation

#![allow(clippy::cast_possible_wrap)]

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, Value};
use serde_json::Value as Json;

use super::row;
use super::schema::Persisted;
use crate::error::{Error, Result};
use crate::models::{Conflict, ConflictId, EntityType, ResolutionAction};
use crate::util::to_millis;

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    async fn insert(&self, conflict: &Conflict) -> Result<()>;

    async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>>;

    /// Open conflicts of one entity, oldest first
    async fn open_for_entity(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>>;

    /// Replace the snapshots of an open conflict with fresher ones
    async fn refresh_open(
        &self,
        id: &ConflictId,
        local_snapshot: &Json,
        remote_snapshot: &Json,
        detail: Option<&str>,
    ) -> Result<bool>;

    /// Open conflicts newest first, optionally for one property
    async fn list_open(&self, property_id: Option<&str>, limit: usize) -> Result<Vec<Conflict>>;

    /// Every conflict of one entity, newest first
    async fn history(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>>;

    /// Close open conflicts of one entity. Returns how many were closed.
    async fn resolve_entity(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
        action: ResolutionAction,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<Conflict> {
        Ok(Conflict {
            id: row::parsed(row, 0)?,
            property_id: row::text(row, 1)?,
            entity_type: row::parsed(row, 2)?,
            local_id: row::opt_text(row, 3)?,
            external_id: row::text(row, 4)?,
            mapping_id: row::opt_parsed(row, 5)?,
            conflict_type: row::parsed(row, 6)?,
            origin: row::parsed(row, 7)?,
            local_snapshot: row::json(row, 8)?,
            remote_snapshot: row::json(row, 9)?,
            resolution_strategy: row::parsed(row, 10)?,
            resolved_by: row::opt_text(row, 11)?,
            resolved_at: row::opt_time(row, 12)?,
            resolution_action: row::opt_parsed(row, 13)?,
            detail: row::opt_text(row, 14)?,
            created_at: row::time(row, 15)?,
        })
    }

    async fn query_many(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Conflict>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse(&row)?);
        }
        Ok(conflicts)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(&self, conflict: &Conflict) -> Result<()> {
        self.conn
            .execute(
                &Conflict::insert_sql(),
                libsql::params![
                    conflict.id.as_str(),
                    conflict.property_id.clone(),
                    conflict.entity_type.as_str(),
                    conflict.local_id.clone(),
                    conflict.external_id.clone(),
                    conflict.mapping_id.map(|id| id.as_str()),
                    conflict.conflict_type.as_str(),
                    conflict.origin.as_str(),
                    serde_json::to_string(&conflict.local_snapshot)?,
                    serde_json::to_string(&conflict.remote_snapshot)?,
                    conflict.resolution_strategy.as_str(),
                    conflict.resolved_by.clone(),
                    conflict.resolved_at.map(to_millis),
                    conflict.resolution_action.map(|a| a.as_str()),
                    conflict.detail.clone(),
                    to_millis(conflict.created_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let sql = format!("{} WHERE id = ?", Conflict::select_sql());
        Ok(self
            .query_many(&sql, vec![id.as_str().into()])
            .await?
            .into_iter()
            .next())
    }

    async fn open_for_entity(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>> {
        let sql = format!(
            "{} WHERE property_id = ? AND entity_type = ? AND external_id = ?
               AND resolution_strategy = 'manual'
             ORDER BY created_at ASC, id ASC",
            Conflict::select_sql()
        );
        self.query_many(
            &sql,
            vec![
                property_id.into(),
                entity_type.as_str().into(),
                external_id.into(),
            ],
        )
        .await
    }

    async fn refresh_open(
        &self,
        id: &ConflictId,
        local_snapshot: &Json,
        remote_snapshot: &Json,
        detail: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE conflicts SET local_snapshot = ?, remote_snapshot = ?, detail = COALESCE(?, detail)
                 WHERE id = ? AND resolution_strategy = 'manual'",
                libsql::params![
                    serde_json::to_string(local_snapshot)?,
                    serde_json::to_string(remote_snapshot)?,
                    detail.map(ToString::to_string),
                    id.as_str(),
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn list_open(&self, property_id: Option<&str>, limit: usize) -> Result<Vec<Conflict>> {
        let limit = (if limit == 0 { 100 } else { limit }) as i64;
        match property_id {
            Some(property_id) => {
                let sql = format!(
                    "{} WHERE property_id = ? AND resolution_strategy = 'manual'
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    Conflict::select_sql()
                );
                self.query_many(&sql, vec![property_id.into(), limit.into()])
                    .await
            }
            None => {
                let sql = format!(
                    "{} WHERE resolution_strategy = 'manual'
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    Conflict::select_sql()
                );
                self.query_many(&sql, vec![limit.into()]).await
            }
        }
    }

    async fn history(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>> {
        let sql = format!(
            "{} WHERE property_id = ? AND entity_type = ? AND external_id = ?
             ORDER BY created_at DESC, id DESC",
            Conflict::select_sql()
        );
        self.query_many(
            &sql,
            vec![
                property_id.into(),
                entity_type.as_str().into(),
                external_id.into(),
            ],
        )
        .await
    }

    async fn resolve_entity(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
        action: ResolutionAction,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        if resolved_by.trim().is_empty() {
            return Err(Error::InvalidInput("resolved_by is required".into()));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE conflicts
                 SET resolution_strategy = 'resolved', resolution_action = ?, resolved_by = ?, resolved_at = ?
                 WHERE property_id = ? AND entity_type = ? AND external_id = ?
                   AND resolution_strategy = 'manual'",
                libsql::params![
                    action.as_str(),
                    resolved_by,
                    to_millis(at),
                    property_id,
                    entity_type.as_str(),
                    external_id,
                ],
            )
            .await?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictType, NewConflict, Origin, ResolutionStrategy};
    use serde_json::json;

    fn detected(conflict_type: ConflictType) -> NewConflict {
        NewConflict {
            property_id: "p1".to_string(),
            entity_type: EntityType::Reservation,
            local_id: Some("r-1".to_string()),
            external_id: "BK-1".to_string(),
            mapping_id: None,
            conflict_type,
            origin: Origin::Channel,
            local_snapshot: json!({"total_amount_cents": 10000}),
            remote_snapshot: json!({"total_amount_cents": 12000}),
            detail: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_conflicts_close_together() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        repo.insert(&detected(ConflictType::Amount).into_manual())
            .await
            .unwrap();
        repo.insert(&detected(ConflictType::Range).into_manual())
            .await
            .unwrap();
        repo.insert(&detected(ConflictType::Status).into_auto(ResolutionAction::AcceptRemote))
            .await
            .unwrap();

        let open = repo
            .open_for_entity("p1", EntityType::Reservation, "BK-1")
            .await
            .unwrap();
        assert_eq!(open.len(), 2);

        let closed = repo
            .resolve_entity(
                "p1",
                EntityType::Reservation,
                "BK-1",
                ResolutionAction::AcceptLocal,
                "frontdesk",
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(closed, 2);
        assert!(repo.list_open(Some("p1"), 10).await.unwrap().is_empty());

        let history = repo
            .history("p1", EntityType::Reservation, "BK-1")
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history
            .iter()
            .filter(|c| c.conflict_type != ConflictType::Status)
            .all(|c| c.resolution_strategy == ResolutionStrategy::Resolved
                && c.resolution_action == Some(ResolutionAction::AcceptLocal)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_only_touches_open_rows() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        let open = detected(ConflictType::Amount).into_manual();
        let auto = detected(ConflictType::Status).into_auto(ResolutionAction::AcceptRemote);
        repo.insert(&open).await.unwrap();
        repo.insert(&auto).await.unwrap();

        let newer = json!({"total_amount_cents": 13000});
        assert!(repo
            .refresh_open(&open.id, &open.local_snapshot, &newer, None)
            .await
            .unwrap());
        assert!(!repo
            .refresh_open(&auto.id, &auto.local_snapshot, &newer, None)
            .await
            .unwrap());

        let stored = repo.get(&open.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_snapshot, newer);
    }
}
