//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
pub async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Apply a list of statements atomically
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: mappings, runs, logs and webhook idempotency
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS sync_mappings (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            local_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            external_property_id TEXT NOT NULL,
            sync_direction TEXT NOT NULL,
            local_hash TEXT,
            external_hash TEXT,
            match_method TEXT,
            match_confidence TEXT,
            last_synced_at INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_sync_mappings_local
            ON sync_mappings(property_id, local_id, entity_type) WHERE active = 1",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_sync_mappings_external
            ON sync_mappings(property_id, external_id, entity_type) WHERE active = 1",
        "CREATE INDEX IF NOT EXISTS idx_sync_mappings_property
            ON sync_mappings(property_id, entity_type, active)",
        "CREATE TABLE IF NOT EXISTS sync_states (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            sync_type TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger TEXT NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            cursor TEXT,
            stats TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            lock_id TEXT,
            lock_expires_at INTEGER,
            needs_attention INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_sync_states_running
            ON sync_states(property_id, sync_type) WHERE status = 'running'",
        "CREATE INDEX IF NOT EXISTS idx_sync_states_pair
            ON sync_states(property_id, sync_type, created_at DESC)",
        "CREATE TABLE IF NOT EXISTS sync_logs (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            run_id TEXT,
            operation TEXT NOT NULL,
            direction TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            local_id TEXT,
            external_id TEXT,
            success INTEGER NOT NULL,
            conflict INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            request TEXT,
            response TEXT,
            error TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_property
            ON sync_logs(property_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_run ON sync_logs(run_id)",
        "CREATE TRIGGER IF NOT EXISTS sync_logs_no_update BEFORE UPDATE ON sync_logs
         BEGIN
             SELECT RAISE(ABORT, 'sync_logs is append-only');
         END",
        "CREATE TRIGGER IF NOT EXISTS sync_logs_no_delete BEFORE DELETE ON sync_logs
         BEGIN
             SELECT RAISE(ABORT, 'sync_logs is append-only');
         END",
        "CREATE TABLE IF NOT EXISTS webhook_events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            received_at INTEGER NOT NULL,
            processed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_webhook_events_pending
            ON webhook_events(processed, received_at)",
        "CREATE TRIGGER IF NOT EXISTS webhook_events_frozen BEFORE UPDATE ON webhook_events
         FOR EACH ROW
         WHEN OLD.processed = 1
         BEGIN
             SELECT RAISE(ABORT, 'webhook event already processed');
         END",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: conflict queue, dead letters, per-property policy
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            local_id TEXT,
            external_id TEXT NOT NULL,
            mapping_id TEXT,
            conflict_type TEXT NOT NULL,
            origin TEXT NOT NULL,
            local_snapshot TEXT NOT NULL,
            remote_snapshot TEXT NOT NULL,
            resolution_strategy TEXT NOT NULL,
            resolved_by TEXT,
            resolved_at INTEGER,
            resolution_action TEXT,
            detail TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_open
            ON conflicts(property_id, resolution_strategy, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_entity
            ON conflicts(property_id, entity_type, external_id)",
        "CREATE TABLE IF NOT EXISTS outbound_dead_letters (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            event TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            replayed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_created
            ON outbound_dead_letters(created_at DESC)",
        "CREATE TABLE IF NOT EXISTS property_settings (
            property_id TEXT PRIMARY KEY,
            amount_tolerance_percent REAL,
            timestamp_winner TEXT,
            updated_at INTEGER NOT NULL
        )",
    ];

    apply(conn, 2, &statements).await
}

/// Migration to version 3: processing lease on webhook events
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = ["ALTER TABLE webhook_events ADD COLUMN claimed_until INTEGER"];

    apply(conn, CURRENT_VERSION, &statements).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn exec_err(conn: &Connection, sql: &str) -> String {
        conn.execute(sql, ()).await.unwrap_err().to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_logs_reject_update_and_delete() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO sync_logs (id, property_id, operation, direction, entity_type, success, created_at)
             VALUES ('l1', 'p1', 'create', 'outbound', 'reservation', 1, 0)",
            (),
        )
        .await
        .unwrap();

        let err = exec_err(&conn, "UPDATE sync_logs SET success = 0").await;
        assert!(err.contains("append-only"), "{err}");
        let err = exec_err(&conn, "DELETE FROM sync_logs").await;
        assert!(err.contains("append-only"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processed_webhook_events_are_frozen() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO webhook_events (event_id, event_type, payload, processed, received_at)
             VALUES ('evt-1', 'reservation.created', '{}', 1, 0)",
            (),
        )
        .await
        .unwrap();

        let err = exec_err(&conn, "UPDATE webhook_events SET error = 'x'").await;
        assert!(err.contains("already processed"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_two_database_gains_webhook_lease() {
        let conn = setup().await;
        migrate_v1(&conn).await.unwrap();
        migrate_v2(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO webhook_events (event_id, event_type, payload, received_at)
             VALUES ('evt-1', 'reservation.created', '{}', 0)",
            (),
        )
        .await
        .unwrap();

        run(&conn).await.unwrap();
        assert_eq!(get_version(&conn).await.unwrap(), 3);
        let mut rows = conn
            .query(
                "SELECT claimed_until IS NULL FROM webhook_events WHERE event_id = 'evt-1'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn running_index_allows_one_running_row_per_pair() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        let insert = |id: &'static str, status: &'static str| {
            format!(
                "INSERT INTO sync_states (id, property_id, sync_type, status, trigger, created_at, updated_at)
                 VALUES ('{id}', 'p1', 'reservations', '{status}', 'manual', 0, 0)"
            )
        };

        conn.execute(&insert("a", "running"), ()).await.unwrap();
        conn.execute(&insert("b", "completed"), ()).await.unwrap();
        let err = exec_err(&conn, &insert("c", "running")).await;
        assert!(err.contains("UNIQUE constraint failed"), "{err}");
    }
}
