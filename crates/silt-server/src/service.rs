//! The authoritative sync service: incremental pull, push with
//! per-record conflict detection, and conflict resolution.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use silt_core::checksum::payload_checksum;
use silt_core::models::{
    EntityType, RecordId, ResolutionStrategy, SyncAction, SyncRecord, SyncToken,
};
use silt_core::protocol::{
    ConflictData, PullQuery, PullResponse, PushRequest, PushResponse, RejectReason,
    RejectedRecord, ResolveConflictRequest, SyncStatusResponse, DEFAULT_PULL_LIMIT,
};
use silt_core::registry::EntityRegistry;

use crate::error::AppError;
use crate::rate_limit::user_fingerprint;
use crate::store::SyncStore;

/// Attempts to win a compare-and-append race before giving up
const APPEND_RETRIES: usize = 3;

pub struct SyncService {
    store: SyncStore,
    registry: EntityRegistry,
    max_pull_limit: usize,
    /// Users with a push currently being processed (for the status endpoint)
    in_flight: Mutex<HashSet<String>>,
    /// Last timestamp assigned to an appended record
    clock: AtomicI64,
}

impl SyncService {
    pub fn new(store: SyncStore, registry: EntityRegistry, max_pull_limit: usize) -> Self {
        Self {
            store,
            registry,
            max_pull_limit,
            in_flight: Mutex::new(HashSet::new()),
            clock: AtomicI64::new(0),
        }
    }

    /// Timestamps assigned to appended records are strictly increasing,
    /// so pagination by `timestamp > since` never skips a record that
    /// landed in the same millisecond as the page boundary.
    fn next_record_timestamp(&self) -> i64 {
        let now = now_ms();
        match self
            .clock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(if now > prev { now } else { prev + 1 })
            }) {
            Ok(prev) | Err(prev) => {
                if now > prev {
                    now
                } else {
                    prev + 1
                }
            }
        }
    }

    /// Incremental pull: log entries since the client's last-known
    /// timestamp, with current entity state re-fetched per record.
    pub async fn pull(&self, user_id: &str, query: &PullQuery) -> Result<PullResponse, AppError> {
        let since = query.last_sync_timestamp.unwrap_or(0);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PULL_LIMIT)
            .clamp(1, self.max_pull_limit);

        let requested = query.parse_entity_types()?;
        let entity_types: Vec<EntityType> = match requested {
            Some(types) => {
                // A filtered pull also carries each type's registered
                // related types, so e.g. tasks arrive with their projects
                let mut selected = std::collections::BTreeSet::new();
                for entity_type in types {
                    let Some(config) = self.registry.get(entity_type) else {
                        tracing::warn!(entity_type = %entity_type, "Skipping unregistered entity type on pull");
                        continue;
                    };
                    selected.insert(entity_type);
                    for related in config.include_related {
                        if self.registry.is_registered(*related) {
                            selected.insert(*related);
                        }
                    }
                }
                selected.into_iter().collect()
            }
            None => self.registry.registered_types().collect(),
        };

        let mut records = self
            .store
            .list_since(since, user_id, &entity_types, limit)
            .await?;
        let has_more = records.len() == limit;

        // Clients always receive the latest entity state, not the
        // historical payload, with excluded fields stripped.
        for record in &mut records {
            let Some(config) = self.registry.get(record.entity_type) else {
                continue;
            };
            if record.action == SyncAction::Delete {
                record.data = None;
                continue;
            }
            if let Some((payload, deleted)) =
                self.store.fetch_snapshot(config, &record.entity_id).await?
            {
                if !deleted {
                    record.data = Some(self.registry.strip_excluded(&payload)?);
                    continue;
                }
            }
            // Entity gone since the log entry; fall back to the logged payload
            if let Some(payload) = &record.data {
                record.data = Some(self.registry.strip_excluded(payload)?);
            }
        }

        // Advance the claim only as far as the records actually handed out
        let last_sync_timestamp = records.last().map_or(since, |record| record.timestamp);
        let sync_token = self.recompute_token(user_id, last_sync_timestamp).await?;
        self.store
            .set_last_sync_timestamp(user_id, last_sync_timestamp)
            .await?;

        tracing::info!(
            user = user_fingerprint(user_id),
            count = records.len(),
            has_more,
            "Served sync pull"
        );

        Ok(PullResponse {
            records,
            sync_token,
            has_more,
            server_timestamp: now_ms(),
        })
    }

    /// Push a batch of client mutations. Records are processed
    /// independently: one rejection never blocks or rolls back another.
    pub async fn push(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, AppError> {
        if request.sync_token.user_id != user_id {
            return Err(AppError::forbidden(
                "Sync token does not belong to the authenticated user",
            ));
        }

        self.mark_in_flight(user_id, true);
        let outcome = self.push_inner(user_id, request).await;
        self.mark_in_flight(user_id, false);
        outcome
    }

    async fn push_inner(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, AppError> {
        let token = request.sync_token;
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for record in request.records {
            match self.apply_one(user_id, &token, record).await {
                Ok(PushOutcome::Accepted(id)) => accepted.push(id),
                Ok(PushOutcome::Rejected(rejection)) => rejected.push(rejection),
                Err(error) => return Err(error),
            }
        }

        let sync_token = self
            .recompute_token(user_id, token.last_sync_timestamp)
            .await?;

        tracing::info!(
            user = user_fingerprint(user_id),
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Processed sync push"
        );

        Ok(PushResponse {
            accepted,
            rejected,
            sync_token,
            server_timestamp: now_ms(),
        })
    }

    /// Process one pushed record. Only storage-level failures escape as
    /// errors; everything record-specific becomes a structured rejection.
    async fn apply_one(
        &self,
        user_id: &str,
        token: &SyncToken,
        mut record: SyncRecord,
    ) -> Result<PushOutcome, AppError> {
        let Some(config) = self.registry.get(record.entity_type) else {
            return Ok(PushOutcome::Rejected(RejectedRecord {
                id: record.id,
                reason: RejectReason::Other(format!(
                    "unregistered entity type: {}",
                    record.entity_type
                )),
                conflict_data: None,
            }));
        };

        if let Err(error) = record.validate() {
            return Ok(PushOutcome::Rejected(RejectedRecord {
                id: record.id,
                reason: RejectReason::Other(error.to_string()),
                conflict_data: None,
            }));
        }

        // Resubmission of an already-accepted id is a no-op, not a
        // second append.
        if self.store.record_exists(record.id).await? {
            tracing::debug!(record = %record.id, "Duplicate record id; treating as accepted");
            return Ok(PushOutcome::Accepted(record.id));
        }

        let client_version = token.claimed_version(record.entity_type);

        for attempt in 0..APPEND_RETRIES {
            let server_version = self
                .store
                .max_version(record.entity_type, &record.entity_id)
                .await?;

            if server_version > client_version {
                let server_data = self
                    .store
                    .fetch_snapshot(config, &record.entity_id)
                    .await?
                    .map(|(payload, _)| self.registry.strip_excluded(&payload))
                    .transpose()?;
                self.store
                    .save_conflict(user_id, &record, server_version, client_version)
                    .await?;
                return Ok(PushOutcome::Rejected(RejectedRecord {
                    id: record.id,
                    reason: RejectReason::Conflict,
                    conflict_data: Some(ConflictData {
                        server_version,
                        client_version,
                        server_data,
                        client_data: record.data.clone(),
                    }),
                }));
            }

            record.version = server_version + 1;
            record.timestamp = self.next_record_timestamp();
            record.originating_user_id = user_id.to_string();
            record.checksum = payload_checksum(record.data.as_ref());

            if self.store.append_if_version(&record, server_version).await? {
                self.store.apply_snapshot(config, &record).await?;
                return Ok(PushOutcome::Accepted(record.id));
            }
            tracing::debug!(
                record = %record.id,
                attempt,
                "Lost compare-and-append race; re-reading version"
            );
        }

        Ok(PushOutcome::Rejected(RejectedRecord {
            id: record.id,
            reason: RejectReason::Other("version contention; retry the push".to_string()),
            conflict_data: None,
        }))
    }

    /// Resolve a previously rejected record. Writes always append
    /// a strictly higher version; the log is never rewritten.
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        request: ResolveConflictRequest,
    ) -> Result<(), AppError> {
        let conflict = self
            .store
            .load_conflict(request.record_id, user_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("no open conflict for record {}", request.record_id))
            })?;

        match request.strategy {
            ResolutionStrategy::ServerWins => {
                // Server state is already authoritative; client re-pulls.
            }
            ResolutionStrategy::ClientWins => {
                let record = SyncRecord {
                    // Reusing the rejected id keeps a later push retry of
                    // the same mutation idempotent.
                    id: conflict.record_id,
                    entity_type: conflict.entity_type,
                    entity_id: conflict.entity_id.clone(),
                    action: conflict.action,
                    data: conflict.client_data.clone(),
                    timestamp: 0,
                    originating_user_id: user_id.to_string(),
                    version: 0,
                    checksum: String::new(),
                };
                self.append_resolution(record).await?;
            }
            ResolutionStrategy::Merge => {
                let merged = request.merged_data.ok_or_else(|| {
                    AppError::validation("MERGE resolution requires mergedData")
                })?;
                if !merged.matches_type(conflict.entity_type) {
                    return Err(AppError::validation(format!(
                        "mergedData does not match entity type {}",
                        conflict.entity_type
                    )));
                }
                let record = SyncRecord {
                    id: RecordId::new(),
                    entity_type: conflict.entity_type,
                    entity_id: conflict.entity_id.clone(),
                    action: SyncAction::Update,
                    data: Some(merged),
                    timestamp: 0,
                    originating_user_id: user_id.to_string(),
                    version: 0,
                    checksum: String::new(),
                };
                self.append_resolution(record).await?;
            }
        }

        self.store.mark_conflict_resolved(request.record_id).await?;
        tracing::info!(
            user = user_fingerprint(user_id),
            record = %request.record_id,
            strategy = request.strategy.as_str(),
            "Resolved sync conflict"
        );
        Ok(())
    }

    /// Append a resolution write, bypassing conflict detection but still
    /// going through the atomic version increment.
    async fn append_resolution(&self, mut record: SyncRecord) -> Result<(), AppError> {
        let config = self
            .registry
            .get(record.entity_type)
            .ok_or_else(|| AppError::validation("unregistered entity type"))?;

        for _ in 0..APPEND_RETRIES {
            let server_version = self
                .store
                .max_version(record.entity_type, &record.entity_id)
                .await?;
            record.version = server_version + 1;
            record.timestamp = self.next_record_timestamp();
            record.checksum = payload_checksum(record.data.as_ref());

            if self.store.append_if_version(&record, server_version).await? {
                self.store.apply_snapshot(config, &record).await?;
                return Ok(());
            }
        }
        Err(AppError::Internal(
            "could not append resolution under contention".to_string(),
        ))
    }

    pub async fn status(&self, user_id: &str) -> Result<SyncStatusResponse, AppError> {
        let last_sync_timestamp = self.store.last_sync_timestamp(user_id).await?;
        let pending_changes = self
            .store
            .count_since(last_sync_timestamp.unwrap_or(0), user_id)
            .await?;
        Ok(SyncStatusResponse {
            user_id: user_id.to_string(),
            last_sync_timestamp,
            pending_changes,
            is_online: true,
            sync_in_progress: self.is_in_flight(user_id),
        })
    }

    /// Fresh token, recomputed from the audit log rather than copied
    /// from the request.
    async fn recompute_token(
        &self,
        user_id: &str,
        last_sync_timestamp: i64,
    ) -> Result<SyncToken, AppError> {
        let mut entity_versions = self.store.max_versions().await?;
        entity_versions.retain(|entity_type, _| self.registry.is_registered(*entity_type));
        Ok(SyncToken {
            user_id: user_id.to_string(),
            last_sync_timestamp,
            entity_versions,
        })
    }

    fn mark_in_flight(&self, user_id: &str, active: bool) {
        let Ok(mut guard) = self.in_flight.lock() else {
            return;
        };
        if active {
            guard.insert(user_id.to_string());
        } else {
            guard.remove(user_id);
        }
    }

    fn is_in_flight(&self, user_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|guard| guard.contains(user_id))
            .unwrap_or(false)
    }
}

enum PushOutcome {
    Accepted(RecordId),
    Rejected(RejectedRecord),
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
