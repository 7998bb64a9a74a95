//! Client database migrations

use libsql::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists = rows
        .next()
        .await?
        .is_some_and(|row| row.get::<i32>(0).unwrap_or(0) != 0);
    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i32>(0)?),
        None => Ok(0),
    }
}

/// Migration to version 1: initial schema
async fn migrate_v1(conn: &Connection) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement
    // separately inside a transaction
    conn.execute("BEGIN TRANSACTION", ()).await?;

    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Local mirror of server entities
        "CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            sync_status TEXT NOT NULL,
            last_synced_at INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(sync_status)",
        // Durable queue of local writes awaiting push, oldest first
        "CREATE TABLE IF NOT EXISTS pending_mutations (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            data TEXT,
            timestamp INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_pending_timestamp ON pending_mutations(timestamp)",
        // Conflicts awaiting a resolution choice
        "CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            server_data TEXT,
            local_data TEXT,
            timestamp INTEGER NOT NULL
        )",
        // Sync token, last sync time, and other key/value state
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated client database to version {CURRENT_VERSION}");
    Ok(())
}
