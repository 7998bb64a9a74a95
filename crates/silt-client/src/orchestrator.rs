//! Sync orchestrator: drives the pull/push cycle against the server
//!
//! One cycle: drain server changes page by page, push the queued local
//! mutations, record conflicts, persist the returned token. A cycle that
//! finds another cycle in flight returns immediately with no side
//! effects.

use std::collections::HashMap;

use tokio::sync::Mutex;

use silt_core::models::{
    ConflictRecord, EntityPayload, EntityType, PendingMutation, RecordId, ResolutionStrategy,
    SyncAction, SyncToken,
};
use silt_core::protocol::{PullQuery, PushRequest, ResolveConflictRequest, DEFAULT_PULL_LIMIT};

use crate::error::{ClientError, Result};
use crate::store::LocalStore;
use crate::transport::SyncTransport;

/// Rejections a mutation may accumulate before we warn about it
pub const DEFAULT_RETRY_CAP: u32 = 5;

/// Outcome of one sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub pulled: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub conflicts: usize,
    /// True when another cycle was already in flight and this one did nothing
    pub skipped: bool,
}

impl SyncCycleReport {
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            pulled: 0,
            accepted: 0,
            rejected: 0,
            conflicts: 0,
            skipped: true,
        }
    }
}

pub struct SyncOrchestrator<T: SyncTransport> {
    store: LocalStore,
    transport: T,
    user_id: String,
    pull_limit: usize,
    retry_cap: u32,
    cycle_lock: Mutex<()>,
}

impl<T: SyncTransport> SyncOrchestrator<T> {
    pub fn new(store: LocalStore, transport: T, user_id: impl Into<String>) -> Self {
        Self {
            store,
            transport,
            user_id: user_id.into(),
            pull_limit: DEFAULT_PULL_LIMIT,
            retry_cap: DEFAULT_RETRY_CAP,
            cycle_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn with_pull_limit(mut self, limit: usize) -> Self {
        self.pull_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_retry_cap(mut self, cap: u32) -> Self {
        self.retry_cap = cap;
        self
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Run one full sync cycle. Concurrent calls do not queue up; the
    /// loser returns a skipped report immediately.
    pub async fn run_sync_cycle(&self) -> Result<SyncCycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            tracing::debug!("Sync cycle already in flight; skipping");
            return Ok(SyncCycleReport::skipped());
        };

        let mut report = SyncCycleReport::default();
        let mut token = self
            .store
            .load_token()
            .await?
            .unwrap_or_else(|| SyncToken::initial(&self.user_id));

        // Step 1: drain server changes
        loop {
            let query = PullQuery {
                last_sync_timestamp: Some(token.last_sync_timestamp),
                entity_types: None,
                limit: Some(self.pull_limit),
            };
            let page = self.transport.pull(&query).await?;

            for record in &page.records {
                match self.store.apply_remote_record(record).await {
                    Ok(()) => report.pulled += 1,
                    // A failing store aborts the cycle before the token
                    // is saved; once the token moves past a record we
                    // never wrote, that record is never pulled again.
                    Err(error @ ClientError::StoreUnavailable(_)) => return Err(error),
                    Err(error) => {
                        tracing::warn!(record = %record.id, %error, "Skipping unappliable pulled record");
                    }
                }
            }
            token = page.sync_token;
            if !page.has_more {
                break;
            }
        }

        // Steps 2 and 3: push the queued local writes, oldest first.
        // Mutations at the retry cap stay queued but are no longer
        // submitted; clearing them is the caller's decision.
        let (queue, stalled): (Vec<_>, Vec<_>) = self
            .store
            .list_queue()
            .await?
            .into_iter()
            .partition(|mutation| mutation.retry_count < self.retry_cap);
        for mutation in &stalled {
            tracing::warn!(
                record = %mutation.id,
                retries = mutation.retry_count,
                "Mutation at retry cap; leaving it queued until cleared"
            );
        }
        if !queue.is_empty() {
            token = self.push_queue(queue, token, &mut report).await?;
        }

        // Step 4: persist the claim for the next cycle
        self.store.save_token(&token).await?;
        self.store
            .set_last_sync_at(chrono::Utc::now().timestamp_millis())
            .await?;

        tracing::info!(
            pulled = report.pulled,
            accepted = report.accepted,
            rejected = report.rejected,
            conflicts = report.conflicts,
            "Sync cycle complete"
        );
        Ok(report)
    }

    async fn push_queue(
        &self,
        queue: Vec<PendingMutation>,
        token: SyncToken,
        report: &mut SyncCycleReport,
    ) -> Result<SyncToken> {
        let by_id: HashMap<RecordId, &PendingMutation> =
            queue.iter().map(|mutation| (mutation.id, mutation)).collect();
        let records = queue
            .iter()
            .map(|mutation| mutation.to_record(&self.user_id))
            .collect();

        let response = self
            .transport
            .push(&PushRequest {
                records,
                sync_token: token,
            })
            .await?;

        for id in &response.accepted {
            match by_id.get(id) {
                Some(mutation) => {
                    self.store
                        .confirm_mutation_synced(mutation, response.server_timestamp)
                        .await?;
                }
                None => {
                    tracing::warn!(record = %id, "Server accepted a record we never queued");
                }
            }
            report.accepted += 1;
        }

        for rejection in &response.rejected {
            report.rejected += 1;
            let Some(mutation) = by_id.get(&rejection.id) else {
                tracing::warn!(record = %rejection.id, "Server rejected a record we never queued");
                continue;
            };

            if rejection.reason.is_conflict() {
                let conflict = ConflictRecord {
                    id: rejection.id,
                    entity_type: mutation.entity_type,
                    entity_id: mutation.entity_id.clone(),
                    server_data: rejection
                        .conflict_data
                        .as_ref()
                        .and_then(|data| data.server_data.clone()),
                    local_data: mutation.data.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                self.store.put_conflict(&conflict).await?;
                self.store
                    .mark_entity_conflict(mutation.entity_type, &mutation.entity_id)
                    .await?;
                // The mutation leaves the queue; it now lives in the
                // conflict table until resolved.
                self.store.dequeue_mutation(rejection.id).await?;
                report.conflicts += 1;
                tracing::warn!(
                    record = %rejection.id,
                    entity = %mutation.entity_id,
                    "Push conflict recorded; awaiting resolution"
                );
            } else {
                let retries = self.store.bump_retry(rejection.id).await?;
                if retries >= self.retry_cap {
                    tracing::warn!(
                        record = %rejection.id,
                        retries,
                        reason = rejection.reason.as_str(),
                        "Mutation keeps getting rejected; manual attention needed"
                    );
                }
            }
        }

        Ok(response.sync_token)
    }

    /// Resolve a recorded conflict through the server, then drop the
    /// local copy.
    pub async fn resolve_conflict(
        &self,
        record_id: RecordId,
        strategy: ResolutionStrategy,
        merged_data: Option<EntityPayload>,
    ) -> Result<()> {
        self.transport
            .resolve_conflict(&ResolveConflictRequest {
                record_id,
                strategy,
                merged_data,
            })
            .await?;
        self.store.remove_conflict(record_id).await?;
        Ok(())
    }

    // ----- local write entry points -----

    pub async fn record_local_create(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> Result<RecordId> {
        self.record_local(entity_id.into(), SyncAction::Create, payload)
            .await
    }

    pub async fn record_local_update(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> Result<RecordId> {
        self.record_local(entity_id.into(), SyncAction::Update, payload)
            .await
    }

    pub async fn record_local_delete(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Result<RecordId> {
        let mutation = PendingMutation::new(entity_type, entity_id, SyncAction::Delete, None);
        self.store.record_local_write(&mutation).await?;
        Ok(mutation.id)
    }

    async fn record_local(
        &self,
        entity_id: String,
        action: SyncAction,
        payload: EntityPayload,
    ) -> Result<RecordId> {
        let mutation =
            PendingMutation::new(payload.entity_type(), entity_id, action, Some(payload));
        self.store.record_local_write(&mutation).await?;
        Ok(mutation.id)
    }
}
