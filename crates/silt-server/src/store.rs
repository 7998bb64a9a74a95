//! Server-side persistence: append-only audit log, entity snapshots,
//! stored conflicts, and per-user sync state.
//!
//! The audit log is the source of truth for conflict detection. Version
//! assignment is serialized by `append_if_version`, a conditional insert
//! at the storage layer, never by application-level locking.

use std::collections::BTreeMap;
use std::path::Path;

use libsql::{params, Builder, Connection, Database as LibSqlDatabase, Value};

use silt_core::models::{EntityPayload, EntityType, RecordId, SyncAction, SyncRecord};
use silt_core::registry::EntitySyncConfig;

use crate::error::AppError;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// A rejected client payload kept server-side so CLIENT_WINS resolution
/// can replay it from the record id alone.
#[derive(Debug, Clone)]
pub struct StoredConflict {
    pub record_id: RecordId,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub client_data: Option<EntityPayload>,
    pub server_version: i64,
    pub client_version: i64,
}

pub struct SyncStore {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl SyncStore {
    /// Open the server database at the given path, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::build(&path_str).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self, AppError> {
        Self::build(":memory:").await
    }

    async fn build(path: &str) -> Result<Self, AppError> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        let store = Self { _db: db, conn };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn configure(&self) -> Result<(), AppError> {
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<(), AppError> {
        if schema_version(&self.conn).await? >= CURRENT_VERSION {
            return Ok(());
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Append-only audit log; the unique key doubles as the
            // compare-and-append backstop.
            "CREATE TABLE IF NOT EXISTS sync_log (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT,
                timestamp INTEGER NOT NULL,
                originating_user_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                UNIQUE (entity_type, entity_id, version)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_log_timestamp ON sync_log(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_sync_log_entity ON sync_log(entity_type, entity_id)",
            // Current entity snapshots, one table per registered type
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS user_profiles (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
            // Rejected payloads, kept so resolve-conflict can replay them
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                record_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                client_action TEXT NOT NULL,
                client_data TEXT,
                server_version INTEGER NOT NULL,
                client_version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_user ON sync_conflicts(user_id, resolved)",
            "CREATE TABLE IF NOT EXISTS user_sync_state (
                user_id TEXT PRIMARY KEY,
                last_sync_timestamp INTEGER NOT NULL
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ];

        for stmt in statements {
            if let Err(e) = self.conn.execute(stmt, ()).await {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        tracing::info!("Migrated server database to version {CURRENT_VERSION}");
        Ok(())
    }

    /// Append a log entry only if the current max version for the entity
    /// still equals `expected_version`. Returns false when another writer
    /// got there first.
    pub async fn append_if_version(
        &self,
        record: &SyncRecord,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let data = record
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let rows = self
            .conn
            .execute(
                "INSERT INTO sync_log
                    (id, entity_type, entity_id, action, data, timestamp,
                     originating_user_id, version, checksum)
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
                 WHERE (SELECT COALESCE(MAX(version), 0) FROM sync_log
                        WHERE entity_type = ? AND entity_id = ?) = ?",
                params![
                    record.id.as_str(),
                    record.entity_type.as_str(),
                    record.entity_id.as_str(),
                    record.action.as_str(),
                    data,
                    record.timestamp,
                    record.originating_user_id.as_str(),
                    record.version,
                    record.checksum.as_str(),
                    record.entity_type.as_str(),
                    record.entity_id.as_str(),
                    expected_version,
                ],
            )
            .await?;

        Ok(rows == 1)
    }

    /// Whether a record id has already been accepted into the log
    pub async fn record_exists(&self, id: RecordId) -> Result<bool, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sync_log WHERE id = ?)",
                params![id.as_str()],
            )
            .await?;
        let exists = rows
            .next()
            .await?
            .is_some_and(|row| row.get::<i32>(0).unwrap_or(0) != 0);
        Ok(exists)
    }

    /// Highest accepted version for one entity (0 if none)
    pub async fn max_version(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<i64, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM sync_log
                 WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    /// Highest accepted version per entity type across the whole log
    pub async fn max_versions(&self) -> Result<BTreeMap<EntityType, i64>, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, MAX(version) FROM sync_log GROUP BY entity_type",
                (),
            )
            .await?;

        let mut versions = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let type_str: String = row.get(0)?;
            let version: i64 = row.get(1)?;
            // Types removed from the registry may linger in old logs
            if let Ok(entity_type) = type_str.parse::<EntityType>() {
                versions.insert(entity_type, version);
            }
        }
        Ok(versions)
    }

    /// Page of log entries after `since`, excluding the caller's own
    /// writes, timestamp ascending
    pub async fn list_since(
        &self,
        since: i64,
        exclude_user: &str,
        entity_types: &[EntityType],
        limit: usize,
    ) -> Result<Vec<SyncRecord>, AppError> {
        if entity_types.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; entity_types.len()].join(", ");
        let sql = format!(
            "SELECT id, entity_type, entity_id, action, data, timestamp,
                    originating_user_id, version, checksum
             FROM sync_log
             WHERE timestamp > ? AND originating_user_id != ?
               AND entity_type IN ({placeholders})
             ORDER BY timestamp ASC, version ASC
             LIMIT ?"
        );

        let mut args: Vec<Value> = vec![Value::from(since), Value::from(exclude_user)];
        for entity_type in entity_types {
            args.push(Value::from(entity_type.as_str()));
        }
        #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
        args.push(Value::from(limit as i64));

        let mut rows = self.conn.query(&sql, args).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    /// Count of log entries after `since` not originated by the user
    pub async fn count_since(&self, since: i64, exclude_user: &str) -> Result<i64, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_log
                 WHERE timestamp > ? AND originating_user_id != ?",
                params![since, exclude_user],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    /// Current snapshot of one entity: payload plus soft-deleted flag
    pub async fn fetch_snapshot(
        &self,
        config: &EntitySyncConfig,
        entity_id: &str,
    ) -> Result<Option<(EntityPayload, bool)>, AppError> {
        let sql = format!(
            "SELECT data, is_deleted FROM {} WHERE id = ?",
            config.table
        );
        let mut rows = self.conn.query(&sql, params![entity_id]).await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let data: String = row.get(0)?;
        let is_deleted = row.get::<i32>(1)? != 0;
        let payload: EntityPayload =
            serde_json::from_str(&data).map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(Some((payload, is_deleted)))
    }

    /// Apply an accepted mutation to the entity's snapshot table,
    /// honoring the type's soft-delete policy
    pub async fn apply_snapshot(
        &self,
        config: &EntitySyncConfig,
        record: &SyncRecord,
    ) -> Result<(), AppError> {
        let now = record.timestamp;
        match record.action {
            SyncAction::Create | SyncAction::Update => {
                let payload = record.data.as_ref().ok_or_else(|| {
                    AppError::validation("missing payload for create/update")
                })?;
                let data = serde_json::to_string(payload)
                    .map_err(|e| AppError::Internal(e.to_string()))?;
                let sql = format!(
                    "INSERT INTO {} (id, data, is_deleted, updated_at) VALUES (?, ?, 0, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        data = excluded.data,
                        is_deleted = 0,
                        updated_at = excluded.updated_at",
                    config.table
                );
                self.conn
                    .execute(&sql, params![record.entity_id.as_str(), data, now])
                    .await?;
            }
            SyncAction::Delete if config.soft_delete => {
                let sql = format!(
                    "UPDATE {} SET is_deleted = 1, updated_at = ? WHERE id = ?",
                    config.table
                );
                self.conn
                    .execute(&sql, params![now, record.entity_id.as_str()])
                    .await?;
            }
            SyncAction::Delete => {
                let sql = format!("DELETE FROM {} WHERE id = ?", config.table);
                self.conn
                    .execute(&sql, params![record.entity_id.as_str()])
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn save_conflict(
        &self,
        user_id: &str,
        record: &SyncRecord,
        server_version: i64,
        client_version: i64,
    ) -> Result<(), AppError> {
        let client_data = record
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_conflicts
                    (record_id, user_id, entity_type, entity_id, client_action,
                     client_data, server_version, client_version, created_at, resolved)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                params![
                    record.id.as_str(),
                    user_id,
                    record.entity_type.as_str(),
                    record.entity_id.as_str(),
                    record.action.as_str(),
                    client_data,
                    server_version,
                    client_version,
                    chrono::Utc::now().timestamp_millis(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Load an unresolved conflict owned by the user
    pub async fn load_conflict(
        &self,
        record_id: RecordId,
        user_id: &str,
    ) -> Result<Option<StoredConflict>, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, user_id, entity_type, entity_id, client_action,
                        client_data, server_version, client_version
                 FROM sync_conflicts
                 WHERE record_id = ? AND user_id = ? AND resolved = 0",
                params![record_id.as_str(), user_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let record_id: String = row.get(0)?;
        let entity_type: String = row.get(2)?;
        let action: String = row.get(4)?;
        let client_data: Option<String> = row.get(5)?;

        Ok(Some(StoredConflict {
            record_id: record_id
                .parse()
                .map_err(|_| AppError::Internal("corrupt conflict record id".to_string()))?,
            user_id: row.get(1)?,
            entity_type: entity_type
                .parse()
                .map_err(|e: silt_core::Error| AppError::Internal(e.to_string()))?,
            entity_id: row.get(3)?,
            action: action
                .parse()
                .map_err(|e: silt_core::Error| AppError::Internal(e.to_string()))?,
            client_data: client_data
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| AppError::Internal(e.to_string()))?,
            server_version: row.get(6)?,
            client_version: row.get(7)?,
        }))
    }

    pub async fn mark_conflict_resolved(&self, record_id: RecordId) -> Result<(), AppError> {
        self.conn
            .execute(
                "UPDATE sync_conflicts SET resolved = 1 WHERE record_id = ?",
                params![record_id.as_str()],
            )
            .await?;
        Ok(())
    }

    pub async fn last_sync_timestamp(&self, user_id: &str) -> Result<Option<i64>, AppError> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_sync_timestamp FROM user_sync_state WHERE user_id = ?",
                params![user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    pub async fn set_last_sync_timestamp(
        &self,
        user_id: &str,
        timestamp: i64,
    ) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO user_sync_state (user_id, last_sync_timestamp)
                 VALUES (?, ?)",
                params![user_id, timestamp],
            )
            .await?;
        Ok(())
    }
}

async fn schema_version(conn: &Connection) -> Result<i32, AppError> {
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

fn parse_record(row: &libsql::Row) -> Result<SyncRecord, AppError> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let action: String = row.get(3)?;
    let data: Option<String> = row.get(4)?;

    Ok(SyncRecord {
        id: id
            .parse()
            .map_err(|_| AppError::Internal("corrupt record id in sync_log".to_string()))?,
        entity_type: entity_type
            .parse()
            .map_err(|e: silt_core::Error| AppError::Internal(e.to_string()))?,
        entity_id: row.get(2)?,
        action: action
            .parse()
            .map_err(|e: silt_core::Error| AppError::Internal(e.to_string()))?,
        data: data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?,
        timestamp: row.get(5)?,
        originating_user_id: row.get(6)?,
        version: row.get(7)?,
        checksum: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use silt_core::checksum::payload_checksum;
    use silt_core::models::{EntityPayload, TaskPayload};
    use silt_core::registry::EntityRegistry;

    use super::*;

    fn task_payload(title: &str) -> EntityPayload {
        EntityPayload::Task(TaskPayload {
            title: title.to_string(),
            notes: None,
            done: false,
            project_id: None,
            due_at: None,
        })
    }

    fn record(entity_id: &str, user: &str, version: i64, timestamp: i64) -> SyncRecord {
        let data = Some(task_payload("hello"));
        SyncRecord {
            id: RecordId::new(),
            entity_type: EntityType::Task,
            entity_id: entity_id.to_string(),
            action: SyncAction::Create,
            checksum: payload_checksum(data.as_ref()),
            data,
            timestamp,
            originating_user_id: user.to_string(),
            version,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_if_version_enforces_expected_version() {
        let store = SyncStore::open_in_memory().await.unwrap();

        let first = record("t-1", "user-a", 1, 100);
        assert!(store.append_if_version(&first, 0).await.unwrap());

        // Stale expectation loses
        let stale = record("t-1", "user-b", 2, 200);
        assert!(!store.append_if_version(&stale, 0).await.unwrap());

        // Correct expectation wins
        let next = record("t-1", "user-b", 2, 200);
        assert!(store.append_if_version(&next, 1).await.unwrap());

        assert_eq!(store.max_version(EntityType::Task, "t-1").await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_since_excludes_own_writes_and_pages() {
        let store = SyncStore::open_in_memory().await.unwrap();

        for (i, user) in ["user-a", "user-b", "user-b", "user-b"].iter().enumerate() {
            let entity_id = format!("t-{i}");
            let rec = record(&entity_id, user, 1, 100 + i as i64);
            assert!(store.append_if_version(&rec, 0).await.unwrap());
        }

        let page = store
            .list_since(0, "user-a", &[EntityType::Task], 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|r| r.originating_user_id == "user-b"));
        assert!(page[0].timestamp <= page[1].timestamp);

        let rest = store
            .list_since(page[1].timestamp, "user-a", &[EntityType::Task], 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshots_honor_soft_delete_policy() {
        let store = SyncStore::open_in_memory().await.unwrap();
        let registry = EntityRegistry::standard();
        let config = registry.get(EntityType::Task).unwrap();

        let create = record("t-1", "user-a", 1, 100);
        store.apply_snapshot(config, &create).await.unwrap();

        let (payload, deleted) = store.fetch_snapshot(config, "t-1").await.unwrap().unwrap();
        assert_eq!(payload, task_payload("hello"));
        assert!(!deleted);

        let mut delete = record("t-1", "user-a", 2, 200);
        delete.action = SyncAction::Delete;
        delete.data = None;
        store.apply_snapshot(config, &delete).await.unwrap();

        // Tasks soft-delete: row stays, flagged
        let (_, deleted) = store.fetch_snapshot(config, "t-1").await.unwrap().unwrap();
        assert!(deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_round_trip_and_resolve() {
        let store = SyncStore::open_in_memory().await.unwrap();
        let rec = record("t-1", "user-a", 0, 100);

        store.save_conflict("user-a", &rec, 5, 3).await.unwrap();

        let stored = store
            .load_conflict(rec.id, "user-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.server_version, 5);
        assert_eq!(stored.client_version, 3);
        assert_eq!(stored.client_data, rec.data);

        // Wrong user sees nothing
        assert!(store
            .load_conflict(rec.id, "user-b")
            .await
            .unwrap()
            .is_none());

        store.mark_conflict_resolved(rec.id).await.unwrap();
        assert!(store
            .load_conflict(rec.id, "user-a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn migrations_are_idempotent() {
        let store = SyncStore::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(schema_version(&store.conn).await.unwrap(), CURRENT_VERSION);
    }
}
