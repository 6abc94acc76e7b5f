//! Database layer for innsync

mod connection;
mod conflict_repository;
mod dead_letter_repository;
mod mapping_repository;
mod migrations;
mod property_settings_repository;
mod row;
mod schema;
mod sync_log_repository;
mod sync_state_repository;
mod webhook_repository;

pub use connection::Database;
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use dead_letter_repository::{DeadLetterRepository, LibSqlDeadLetterRepository};
pub use mapping_repository::{
    HashUpdate, LibSqlMappingRepository, MappingFilter, MappingRepository,
};
pub use migrations::get_version as schema_version;
pub use property_settings_repository::{
    LibSqlPropertySettingsRepository, PropertySettingsRepository,
};
pub use schema::{DeletionPolicy, Persisted};
pub use sync_log_repository::{LibSqlSyncLogRepository, LogFilter, SyncLogRepository};
pub use sync_state_repository::{
    LibSqlSyncStateRepository, LockClaim, RunOutcome, SyncStateRepository,
};
pub use webhook_repository::{LibSqlWebhookEventRepository, WebhookEventRepository};
