//! Shared store wrapper used by the engine, the API and the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{
    ConflictRepository, Database, DeadLetterRepository, HashUpdate, LibSqlConflictRepository,
    LibSqlDeadLetterRepository, LibSqlMappingRepository, LibSqlPropertySettingsRepository,
    LibSqlSyncLogRepository, LibSqlSyncStateRepository, LibSqlWebhookEventRepository, LockClaim,
    LogFilter, MappingFilter, MappingRepository, PropertySettingsRepository, RunOutcome,
    SyncLogRepository, SyncStateRepository, WebhookEventRepository,
};
use crate::models::{
    Conflict, ConflictId, DeadLetter, DeadLetterId, EntityType, MappingId, NewMapping,
    PropertySettings, ResolutionAction, RunId, SyncLog, SyncMapping, SyncState, SyncStats,
    SyncStatus, SyncType, WebhookEvent,
};
use crate::Result;

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SyncStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %db_path.display(), "Opening sync store");
        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, if file-backed
    pub fn path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// Applied schema version
    pub async fn schema_version(&self) -> Result<i32> {
        let db = self.db.lock().await;
        crate::db::schema_version(db.connection()).await
    }

    // -- mappings ---------------------------------------------------------

    pub async fn create_mapping(&self, new: NewMapping, synced: bool) -> Result<SyncMapping> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.create(new, synced).await
    }

    pub async fn get_mapping(&self, id: &MappingId) -> Result<Option<SyncMapping>> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.get(id).await
    }

    pub async fn find_mapping_by_local(
        &self,
        property_id: &str,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<SyncMapping>> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.find_by_local(property_id, entity_type, local_id).await
    }

    pub async fn find_mapping_by_external(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<SyncMapping>> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.find_by_external(property_id, entity_type, external_id)
            .await
    }

    pub async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<SyncMapping>> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.list(filter).await
    }

    /// Optimistic hash update; `StaleWrite` if `expected_local_hash` is outdated.
    pub async fn compare_and_set_hashes(
        &self,
        id: &MappingId,
        expected_local_hash: Option<&str>,
        update: &HashUpdate,
    ) -> Result<SyncMapping> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.compare_and_set_hashes(id, expected_local_hash, update)
            .await
    }

    pub async fn retire_mapping(&self, id: &MappingId) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMappingRepository::new(db.connection());
        repo.retire(id).await
    }

    // -- sync runs --------------------------------------------------------

    pub async fn reap_expired_runs(
        &self,
        property_id: &str,
        sync_type: SyncType,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.reap_expired(property_id, sync_type, now).await
    }

    pub async fn insert_running_run(&self, state: &SyncState, claim: &LockClaim) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.insert_running(state, claim).await
    }

    pub async fn claim_pending_run(
        &self,
        id: &RunId,
        claim: &LockClaim,
    ) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.claim_pending(id, claim).await
    }

    pub async fn insert_pending_run(&self, state: &SyncState) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.insert_pending(state).await
    }

    pub async fn checkpoint_run(
        &self,
        id: &RunId,
        lock_id: &str,
        cursor: Option<&str>,
        stats: &SyncStats,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.checkpoint(id, lock_id, cursor, stats, expires_at)
            .await
    }

    pub async fn finish_run(
        &self,
        id: &RunId,
        lock_id: &str,
        outcome: &RunOutcome,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.finish(id, lock_id, outcome).await
    }

    pub async fn cancel_run(&self, id: &RunId, reason: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.cancel(id, reason).await
    }

    pub async fn cancel_pending_runs(
        &self,
        property_id: &str,
        sync_type: SyncType,
        reason: &str,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.cancel_pending(property_id, sync_type, reason).await
    }

    pub async fn clear_attention(&self, property_id: &str, sync_type: SyncType) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.clear_attention(property_id, sync_type).await
    }

    pub async fn get_run(&self, id: &RunId) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.get(id).await
    }

    pub async fn latest_run_with_status(
        &self,
        property_id: &str,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.latest_with_status(property_id, sync_type, status).await
    }

    pub async fn latest_finished_run(
        &self,
        property_id: &str,
        sync_type: SyncType,
    ) -> Result<Option<SyncState>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.latest_finished(property_id, sync_type).await
    }

    pub async fn needs_attention(&self, property_id: &str, sync_type: SyncType) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.needs_attention(property_id, sync_type).await
    }

    pub async fn list_runs(
        &self,
        property_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncState>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.list(property_id, limit).await
    }

    pub async fn count_running(&self, property_id: &str, sync_type: SyncType) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStateRepository::new(db.connection());
        repo.count_running(property_id, sync_type).await
    }

    // -- logs -------------------------------------------------------------

    pub async fn append_log(&self, log: &SyncLog) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());
        repo.append(log).await
    }

    pub async fn list_logs(&self, filter: &LogFilter) -> Result<Vec<SyncLog>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());
        repo.list(filter).await
    }

    // -- conflicts --------------------------------------------------------

    pub async fn insert_conflict(&self, conflict: &Conflict) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.insert(conflict).await
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.get(id).await
    }

    pub async fn open_conflicts_for_entity(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.open_for_entity(property_id, entity_type, external_id)
            .await
    }

    pub async fn refresh_open_conflict(
        &self,
        id: &ConflictId,
        local_snapshot: &Value,
        remote_snapshot: &Value,
        detail: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.refresh_open(id, local_snapshot, remote_snapshot, detail)
            .await
    }

    pub async fn list_open_conflicts(
        &self,
        property_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.list_open(property_id, limit).await
    }

    pub async fn conflict_history(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.history(property_id, entity_type, external_id).await
    }

    pub async fn resolve_entity_conflicts(
        &self,
        property_id: &str,
        entity_type: EntityType,
        external_id: &str,
        action: ResolutionAction,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.resolve_entity(property_id, entity_type, external_id, action, resolved_by, at)
            .await
    }

    // -- webhook events ---------------------------------------------------

    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.insert_if_absent(event).await
    }

    pub async fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEvent>> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.get(event_id).await
    }

    pub async fn claim_webhook_event(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.claim(event_id, now, lease).await
    }

    pub async fn mark_webhook_processed(&self, event_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.mark_processed(event_id).await
    }

    pub async fn mark_webhook_failed(&self, event_id: &str, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.mark_failed(event_id, error).await
    }

    pub async fn list_unprocessed_webhooks(&self, limit: usize) -> Result<Vec<WebhookEvent>> {
        let db = self.db.lock().await;
        let repo = LibSqlWebhookEventRepository::new(db.connection());
        repo.list_unprocessed(limit).await
    }

    // -- dead letters -----------------------------------------------------

    pub async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlDeadLetterRepository::new(db.connection());
        repo.insert(letter).await
    }

    pub async fn get_dead_letter(&self, id: &DeadLetterId) -> Result<Option<DeadLetter>> {
        let db = self.db.lock().await;
        let repo = LibSqlDeadLetterRepository::new(db.connection());
        repo.get(id).await
    }

    pub async fn list_dead_letters(
        &self,
        include_replayed: bool,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        let repo = LibSqlDeadLetterRepository::new(db.connection());
        repo.list(include_replayed, limit).await
    }

    pub async fn mark_dead_letter_replayed(&self, id: &DeadLetterId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlDeadLetterRepository::new(db.connection());
        repo.mark_replayed(id).await
    }

    // -- property settings ------------------------------------------------

    pub async fn property_settings(&self, property_id: &str) -> Result<Option<PropertySettings>> {
        let db = self.db.lock().await;
        let repo = LibSqlPropertySettingsRepository::new(db.connection());
        repo.get(property_id).await
    }

    pub async fn save_property_settings(&self, settings: &PropertySettings) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlPropertySettingsRepository::new(db.connection());
        repo.save(settings).await
    }

    pub async fn delete_property_settings(&self, property_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlPropertySettingsRepository::new(db.connection());
        repo.delete(property_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchMethod, SyncDirection};
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn file_store_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("innsync.db");
        let store = SyncStore::open_path(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(store.schema_version().await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn debug_shows_location_only() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("innsync.db");
        let store = SyncStore::open_path(&path).await.unwrap();

        let rendered = format!("{store:?}");
        assert!(rendered.starts_with("SyncStore"));
        assert!(rendered.contains("innsync.db"));
        assert!(format!("{:?}", SyncStore::open_in_memory().await.unwrap()).contains("None"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clones_share_one_database() {
        let store = SyncStore::open_in_memory().await.unwrap();
        let clone = store.clone();

        clone
            .create_mapping(
                NewMapping {
                    property_id: "p1".to_string(),
                    entity_type: EntityType::Guest,
                    local_id: "g-1".to_string(),
                    external_id: "C-1".to_string(),
                    external_property_id: "H-42".to_string(),
                    sync_direction: SyncDirection::Inbound,
                    local_hash: None,
                    external_hash: None,
                    match_method: Some(MatchMethod::Email),
                    match_confidence: None,
                },
                true,
            )
            .await
            .unwrap();

        assert!(store
            .find_mapping_by_external("p1", EntityType::Guest, "C-1")
            .await
            .unwrap()
            .is_some());
    }
}
