//! Durable local store: entity cache, pending mutation queue, conflicts,
//! and sync metadata.
//!
//! Every multi-statement logical operation runs inside a transaction so a
//! crash mid-write never leaves the cache and the queue disagreeing.

use libsql::{params, Connection};

use silt_core::models::{
    CachedEntity, ConflictRecord, EntityType, PendingMutation, RecordId, SyncAction, SyncStatus,
    SyncToken,
};

use crate::db::Database;
use crate::error::{ClientError, Result};

const TOKEN_KEY: &str = "sync_token";
const LAST_SYNC_KEY: &str = "last_sync_at";

pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection().clone(),
        }
    }

    // ----- entity cache -----

    pub async fn put_entity(&self, entity: &CachedEntity) -> Result<()> {
        let data = serde_json::to_string(&entity.data)?;
        self.conn
            .execute(
                "INSERT INTO entities
                    (entity_type, entity_id, data, sync_status, last_synced_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    data = excluded.data,
                    sync_status = excluded.sync_status,
                    last_synced_at = excluded.last_synced_at,
                    updated_at = excluded.updated_at",
                params![
                    entity.entity_type.as_str(),
                    entity.entity_id.as_str(),
                    data,
                    entity.sync_status.as_str(),
                    entity.last_synced_at,
                    now_ms(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<CachedEntity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, entity_id, data, sync_status, last_synced_at
                 FROM entities WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_entity(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, entity_id, data, sync_status, last_synced_at
                 FROM entities WHERE entity_type = ? ORDER BY entity_id",
                params![entity_type.as_str()],
            )
            .await?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push(parse_entity(&row)?);
        }
        Ok(entities)
    }

    pub async fn delete_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
            )
            .await?;
        Ok(())
    }

    /// Promote a cached entity to `Synced` after the server accepted it
    pub async fn mark_entity_synced(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        synced_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET sync_status = ?, last_synced_at = ?
                 WHERE entity_type = ? AND entity_id = ?",
                params![
                    SyncStatus::Synced.as_str(),
                    synced_at,
                    entity_type.as_str(),
                    entity_id
                ],
            )
            .await?;
        Ok(())
    }

    /// Flag a cached entity as conflicted so UIs can surface it
    pub async fn mark_entity_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET sync_status = ? WHERE entity_type = ? AND entity_id = ?",
                params![
                    SyncStatus::Conflict.as_str(),
                    entity_type.as_str(),
                    entity_id
                ],
            )
            .await?;
        Ok(())
    }

    /// Apply a pulled server record to the local cache
    pub async fn apply_remote_record(
        &self,
        record: &silt_core::models::SyncRecord,
    ) -> Result<()> {
        match record.action {
            SyncAction::Create | SyncAction::Update => {
                let payload = record.data.as_ref().ok_or_else(|| {
                    ClientError::InvalidInput("pulled record is missing its payload".to_string())
                })?;
                self.put_entity(&CachedEntity {
                    entity_type: record.entity_type,
                    entity_id: record.entity_id.clone(),
                    data: payload.clone(),
                    sync_status: SyncStatus::Synced,
                    last_synced_at: Some(record.timestamp),
                })
                .await
            }
            SyncAction::Delete => self.delete_entity(record.entity_type, &record.entity_id).await,
        }
    }

    // ----- mutation queue -----

    /// Record a local write: optimistic cache update plus a queued
    /// mutation, atomically.
    pub async fn record_local_write(&self, mutation: &PendingMutation) -> Result<()> {
        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let outcome = self.record_local_write_inner(mutation).await;
        match outcome {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn record_local_write_inner(&self, mutation: &PendingMutation) -> Result<()> {
        match mutation.action {
            SyncAction::Create | SyncAction::Update => {
                let payload = mutation.data.as_ref().ok_or_else(|| {
                    ClientError::InvalidInput("create/update requires a payload".to_string())
                })?;
                let data = serde_json::to_string(payload)?;
                self.conn
                    .execute(
                        "INSERT INTO entities
                            (entity_type, entity_id, data, sync_status, last_synced_at, updated_at)
                         VALUES (?, ?, ?, ?, NULL, ?)
                         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                            data = excluded.data,
                            sync_status = excluded.sync_status,
                            updated_at = excluded.updated_at",
                        params![
                            mutation.entity_type.as_str(),
                            mutation.entity_id.as_str(),
                            data,
                            SyncStatus::Pending.as_str(),
                            mutation.timestamp,
                        ],
                    )
                    .await?;
            }
            SyncAction::Delete => {
                self.conn
                    .execute(
                        "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
                        params![mutation.entity_type.as_str(), mutation.entity_id.as_str()],
                    )
                    .await?;
            }
        }
        self.insert_mutation(mutation).await
    }

    pub async fn enqueue_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.insert_mutation(mutation).await
    }

    async fn insert_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        let data = mutation
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO pending_mutations
                    (id, entity_type, entity_id, action, data, timestamp, retry_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    mutation.id.as_str(),
                    mutation.entity_type.as_str(),
                    mutation.entity_id.as_str(),
                    mutation.action.as_str(),
                    data,
                    mutation.timestamp,
                    i64::from(mutation.retry_count),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn dequeue_mutation(&self, id: RecordId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM pending_mutations WHERE id = ?",
                params![id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Retire an accepted mutation: the queue row goes away and the
    /// cached entity is promoted to `Synced`, atomically. On failure the
    /// row stays queued and resubmission is a server-side no-op.
    pub async fn confirm_mutation_synced(
        &self,
        mutation: &PendingMutation,
        synced_at: i64,
    ) -> Result<()> {
        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let outcome = self.confirm_mutation_synced_inner(mutation, synced_at).await;
        match outcome {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn confirm_mutation_synced_inner(
        &self,
        mutation: &PendingMutation,
        synced_at: i64,
    ) -> Result<()> {
        self.dequeue_mutation(mutation.id).await?;
        // Deletes leave no cached row to promote
        if mutation.action != SyncAction::Delete {
            self.mark_entity_synced(mutation.entity_type, &mutation.entity_id, synced_at)
                .await?;
        }
        Ok(())
    }

    pub async fn bump_retry(&self, id: RecordId) -> Result<u32> {
        self.conn
            .execute(
                "UPDATE pending_mutations SET retry_count = retry_count + 1 WHERE id = ?",
                params![id.as_str()],
            )
            .await?;

        let mut rows = self
            .conn
            .query(
                "SELECT retry_count FROM pending_mutations WHERE id = ?",
                params![id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let count: i64 = row.get(0)?;
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            None => Ok(0),
        }
    }

    /// Queued mutations, oldest first
    pub async fn list_queue(&self) -> Result<Vec<PendingMutation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, entity_id, action, data, timestamp, retry_count
                 FROM pending_mutations ORDER BY timestamp ASC",
                (),
            )
            .await?;

        let mut queue = Vec::new();
        while let Some(row) = rows.next().await? {
            queue.push(parse_mutation(&row)?);
        }
        Ok(queue)
    }

    pub async fn queue_len(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM pending_mutations", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    // ----- conflicts -----

    pub async fn put_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let server_data = conflict
            .server_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let local_data = conflict
            .local_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO conflicts
                    (id, entity_type, entity_id, server_data, local_data, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    conflict.id.as_str(),
                    conflict.entity_type.as_str(),
                    conflict.entity_id.as_str(),
                    server_data,
                    local_data,
                    conflict.timestamp,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, entity_id, server_data, local_data, timestamp
                 FROM conflicts ORDER BY timestamp ASC",
                (),
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    pub async fn remove_conflict(&self, id: RecordId) -> Result<()> {
        self.conn
            .execute("DELETE FROM conflicts WHERE id = ?", params![id.as_str()])
            .await?;
        Ok(())
    }

    // ----- metadata -----

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM metadata WHERE key = ?", params![key])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
                params![key, value],
            )
            .await?;
        Ok(())
    }

    pub async fn load_token(&self) -> Result<Option<SyncToken>> {
        let raw = self.get_metadata(TOKEN_KEY).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(ClientError::from))
            .transpose()
    }

    pub async fn save_token(&self, token: &SyncToken) -> Result<()> {
        let json = serde_json::to_string(token)?;
        self.set_metadata(TOKEN_KEY, &json).await
    }

    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self
            .get_metadata(LAST_SYNC_KEY)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    pub async fn set_last_sync_at(&self, timestamp: i64) -> Result<()> {
        self.set_metadata(LAST_SYNC_KEY, &timestamp.to_string())
            .await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_entity(row: &libsql::Row) -> Result<CachedEntity> {
    let entity_type: String = row.get(0)?;
    let data: String = row.get(2)?;
    let sync_status: String = row.get(3)?;

    Ok(CachedEntity {
        entity_type: entity_type.parse()?,
        entity_id: row.get(1)?,
        data: serde_json::from_str(&data)?,
        sync_status: sync_status.parse()?,
        last_synced_at: row.get(4)?,
    })
}

fn parse_mutation(row: &libsql::Row) -> Result<PendingMutation> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let action: String = row.get(3)?;
    let data: Option<String> = row.get(4)?;
    let retry_count: i64 = row.get(6)?;

    Ok(PendingMutation {
        id: id
            .parse()
            .map_err(|_| ClientError::StoreUnavailable("corrupt mutation id".to_string()))?,
        entity_type: entity_type.parse()?,
        entity_id: row.get(2)?,
        action: action.parse()?,
        data: data.map(|raw| serde_json::from_str(&raw)).transpose()?,
        timestamp: row.get(5)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    })
}

fn parse_conflict(row: &libsql::Row) -> Result<ConflictRecord> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let server_data: Option<String> = row.get(3)?;
    let local_data: Option<String> = row.get(4)?;

    Ok(ConflictRecord {
        id: id
            .parse()
            .map_err(|_| ClientError::StoreUnavailable("corrupt conflict id".to_string()))?,
        entity_type: entity_type.parse()?,
        entity_id: row.get(2)?,
        server_data: server_data.map(|raw| serde_json::from_str(&raw)).transpose()?,
        local_data: local_data.map(|raw| serde_json::from_str(&raw)).transpose()?,
        timestamp: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use silt_core::models::{EntityPayload, TaskPayload};

    use super::*;

    async fn store() -> (Database, LocalStore) {
        let db = Database::open_in_memory().await.unwrap();
        let store = LocalStore::new(&db);
        (db, store)
    }

    fn task(title: &str) -> EntityPayload {
        EntityPayload::Task(TaskPayload {
            title: title.to_string(),
            notes: None,
            done: false,
            project_id: None,
            due_at: None,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entity_cache_round_trips() {
        let (_db, store) = store().await;

        let entity = CachedEntity {
            entity_type: EntityType::Task,
            entity_id: "t-1".to_string(),
            data: task("hello"),
            sync_status: SyncStatus::Synced,
            last_synced_at: Some(100),
        };
        store.put_entity(&entity).await.unwrap();

        let loaded = store
            .get_entity(EntityType::Task, "t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, entity);

        store.delete_entity(EntityType::Task, "t-1").await.unwrap();
        assert!(store
            .get_entity(EntityType::Task, "t-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_write_updates_cache_and_queue_atomically() {
        let (_db, store) = store().await;

        let mutation = PendingMutation::new(
            EntityType::Task,
            "t-1",
            SyncAction::Create,
            Some(task("draft")),
        );
        store.record_local_write(&mutation).await.unwrap();

        let entity = store
            .get_entity(EntityType::Task, "t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Pending);
        assert_eq!(entity.last_synced_at, None);

        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, mutation.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_write_without_payload_rolls_back() {
        let (_db, store) = store().await;

        let bad = PendingMutation::new(EntityType::Task, "t-1", SyncAction::Create, None);
        assert!(store.record_local_write(&bad).await.is_err());
        assert_eq!(store.queue_len().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_is_ordered_and_survives_retries() {
        let (_db, store) = store().await;

        let mut first =
            PendingMutation::new(EntityType::Task, "t-1", SyncAction::Create, Some(task("a")));
        first.timestamp = 100;
        let mut second =
            PendingMutation::new(EntityType::Task, "t-2", SyncAction::Create, Some(task("b")));
        second.timestamp = 200;

        store.enqueue_mutation(&second).await.unwrap();
        store.enqueue_mutation(&first).await.unwrap();

        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue[0].id, first.id);
        assert_eq!(queue[1].id, second.id);

        assert_eq!(store.bump_retry(first.id).await.unwrap(), 1);
        assert_eq!(store.bump_retry(first.id).await.unwrap(), 2);

        store.dequeue_mutation(first.id).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn confirming_a_mutation_clears_queue_and_promotes_entity() {
        let (_db, store) = store().await;

        let mutation = PendingMutation::new(
            EntityType::Task,
            "t-1",
            SyncAction::Create,
            Some(task("draft")),
        );
        store.record_local_write(&mutation).await.unwrap();

        store.confirm_mutation_synced(&mutation, 2_000).await.unwrap();

        assert_eq!(store.queue_len().await.unwrap(), 0);
        let entity = store
            .get_entity(EntityType::Task, "t-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
        assert_eq!(entity.last_synced_at, Some(2_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_round_trip() {
        let (_db, store) = store().await;

        let conflict = ConflictRecord {
            id: RecordId::new(),
            entity_type: EntityType::Task,
            entity_id: "t-1".to_string(),
            server_data: Some(task("server")),
            local_data: Some(task("local")),
            timestamp: 100,
        };
        store.put_conflict(&conflict).await.unwrap();

        let conflicts = store.list_conflicts().await.unwrap();
        assert_eq!(conflicts, vec![conflict.clone()]);

        store.remove_conflict(conflict.id).await.unwrap();
        assert!(store.list_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn token_persists_through_metadata() {
        let (_db, store) = store().await;

        assert!(store.load_token().await.unwrap().is_none());

        let mut token = SyncToken::initial("user-a");
        token.last_sync_timestamp = 42;
        token.entity_versions.insert(EntityType::Task, 7);
        store.save_token(&token).await.unwrap();

        assert_eq!(store.load_token().await.unwrap(), Some(token));

        store.set_last_sync_at(4200).await.unwrap();
        assert_eq!(store.last_sync_at().await.unwrap(), Some(4200));
    }
}
