//! Sync mapping repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use chrono::Utc;
use libsql::{Connection, Row, Value};

use super::row;
use super::schema::Persisted;
use crate::error::{Error, Result};
use crate::models::{EntityType, MappingId, NewMapping, SyncMapping};
use crate::util::to_millis;

/// Filters for listing mappings
#[derive(Debug, Clone, Default)]
pub struct MappingFilter {
    pub property_id: Option<String>,
    pub entity_type: Option<EntityType>,
    /// Include soft-retired rows
    pub include_retired: bool,
    pub limit: usize,
    pub offset: usize,
}

/// Fingerprints written after a successful sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashUpdate {
    pub local_hash: Option<String>,
    pub external_hash: Option<String>,
}

/// Trait for mapping storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MappingRepository {
    /// Insert a new active mapping. Fails with `AlreadyExists` if either side is already mapped.
    async fn create(&self, new: NewMapping, synced: bool) -> Result<SyncMapping>;

    async fn get(&self, id: &MappingId) -> Result<Option<SyncMapping>>;

    /// Active mapping for a local entity
    async fn find_by_local(
        &self,
        property_id: &str,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<SyncMapping>>;

    /// Active mapping for an external entity
    async fn find_by_external(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<SyncMapping>>;

    async fn list(&self, filter: &MappingFilter) -> Result<Vec<SyncMapping>>;

    /// Replace both hashes if `local_hash` still equals `expected_local_hash`.
    ///
    /// Returns `StaleWrite` when another writer updated the row first.
    async fn compare_and_set_hashes(
        &self,
        id: &MappingId,
        expected_local_hash: Option<&str>,
        update: &HashUpdate,
    ) -> Result<SyncMapping>;

    /// Soft-retire an active mapping
    async fn retire(&self, id: &MappingId) -> Result<()>;
}

/// libSQL implementation of `MappingRepository`
pub struct LibSqlMappingRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMappingRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<SyncMapping> {
        Ok(SyncMapping {
            id: row::parsed(row, 0)?,
            property_id: row::text(row, 1)?,
            entity_type: row::parsed(row, 2)?,
            local_id: row::text(row, 3)?,
            external_id: row::text(row, 4)?,
            external_property_id: row::text(row, 5)?,
            sync_direction: row::parsed(row, 6)?,
            local_hash: row::opt_text(row, 7)?,
            external_hash: row::opt_text(row, 8)?,
            match_method: row::opt_parsed(row, 9)?,
            match_confidence: row::opt_parsed(row, 10)?,
            last_synced_at: row::opt_time(row, 11)?,
            active: row::flag(row, 12)?,
            created_at: row::time(row, 13)?,
            updated_at: row::time(row, 14)?,
        })
    }

    async fn query_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<SyncMapping>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Self::parse(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn find_active(
        &self,
        side: &str,
        property_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<SyncMapping>> {
        let live = SyncMapping::DELETION
            .live_filter()
            .map_or_else(String::new, |filter| format!(" AND {filter}"));
        let sql = format!(
            "{} WHERE property_id = ? AND entity_type = ? AND {side} = ?{live}",
            SyncMapping::select_sql()
        );
        self.query_one(
            &sql,
            vec![
                property_id.into(),
                entity_type.as_str().into(),
                id.into(),
            ],
        )
        .await
    }
}

impl MappingRepository for LibSqlMappingRepository<'_> {
    async fn create(&self, new: NewMapping, synced: bool) -> Result<SyncMapping> {
        if new.local_id.trim().is_empty() || new.external_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "mapping needs both a local and an external id".into(),
            ));
        }

        let mapping = SyncMapping::from_new(new, synced);
        let result = self
            .conn
            .execute(
                &SyncMapping::insert_sql(),
                libsql::params![
                    mapping.id.as_str(),
                    mapping.property_id.clone(),
                    mapping.entity_type.as_str(),
                    mapping.local_id.clone(),
                    mapping.external_id.clone(),
                    mapping.external_property_id.clone(),
                    mapping.sync_direction.as_str(),
                    mapping.local_hash.clone(),
                    mapping.external_hash.clone(),
                    mapping.match_method.map(|m| m.as_str()),
                    mapping.match_confidence.map(|c| c.as_str()),
                    mapping.last_synced_at.map(to_millis),
                    i64::from(mapping.active),
                    to_millis(mapping.created_at),
                    to_millis(mapping.updated_at),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(mapping),
            Err(error) => {
                let error = Error::from(error);
                if error.is_unique_violation() {
                    Err(Error::AlreadyExists(format!(
                        "{} {} or {} is already mapped in property {}",
                        mapping.entity_type,
                        mapping.local_id,
                        mapping.external_id,
                        mapping.property_id
                    )))
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn get(&self, id: &MappingId) -> Result<Option<SyncMapping>> {
        let sql = format!("{} WHERE id = ?", SyncMapping::select_sql());
        self.query_one(&sql, vec![id.as_str().into()]).await
    }

    async fn find_by_local(
        &self,
        property_id: &str,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<SyncMapping>> {
        self.find_active("local_id", property_id, entity_type, local_id)
            .await
    }

    async fn find_by_external(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<SyncMapping>> {
        self.find_active("external_id", property_id, entity_type, external_id)
            .await
    }

    async fn list(&self, filter: &MappingFilter) -> Result<Vec<SyncMapping>> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(property_id) = &filter.property_id {
            clauses.push("property_id = ?".to_string());
            params.push(property_id.clone().into());
        }
        if let Some(entity_type) = filter.entity_type {
            clauses.push("entity_type = ?".to_string());
            params.push(entity_type.as_str().into());
        }
        if !filter.include_retired {
            clauses.extend(SyncMapping::DELETION.live_filter());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        params.push((limit as i64).into());
        params.push((filter.offset as i64).into());

        let sql = format!(
            "{}{where_sql} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            SyncMapping::select_sql()
        );
        let mut rows = self.conn.query(&sql, params).await?;
        let mut mappings = Vec::new();
        while let Some(row) = rows.next().await? {
            mappings.push(Self::parse(&row)?);
        }
        Ok(mappings)
    }

    async fn compare_and_set_hashes(
        &self,
        id: &MappingId,
        expected_local_hash: Option<&str>,
        update: &HashUpdate,
    ) -> Result<SyncMapping> {
        let now = to_millis(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_mappings
                 SET local_hash = ?, external_hash = ?, last_synced_at = ?, updated_at = ?
                 WHERE id = ? AND active = 1 AND local_hash IS ?",
                libsql::params![
                    update.local_hash.clone(),
                    update.external_hash.clone(),
                    now,
                    now,
                    id.as_str(),
                    expected_local_hash.map(ToString::to_string),
                ],
            )
            .await?;

        if changed == 0 {
            return Err(Error::StaleWrite(format!("mapping {id}")));
        }

        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mapping {id}")))
    }

    async fn retire(&self, id: &MappingId) -> Result<()> {
        let now = to_millis(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_mappings SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
                libsql::params![now, id.as_str()],
            )
            .await?;

        if changed == 0 {
            return Err(Error::NotFound(format!("mapping {id}")));
        }
        Ok(())
    }
}
