//! Pending mutation queue item

use serde::{Deserialize, Serialize};

use super::entity::{EntityPayload, EntityType};
use super::record::{RecordId, SyncAction, SyncRecord};

/// A local write not yet confirmed accepted by the server
///
/// Created by any local write while offline (or before the next push);
/// removed once the server accepts it; kept with an incremented
/// `retry_count` when rejected for reasons other than conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub data: Option<EntityPayload>,
    /// When the local write happened (unix ms)
    pub timestamp: i64,
    pub retry_count: u32,
}

impl PendingMutation {
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: SyncAction,
        data: Option<EntityPayload>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            entity_type,
            entity_id: entity_id.into(),
            action,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    /// Build the wire record submitted to the server
    ///
    /// The mutation id doubles as the record id, which is what makes
    /// resubmission after a lost acknowledgement idempotent server-side.
    #[must_use]
    pub fn to_record(&self, user_id: &str) -> SyncRecord {
        SyncRecord {
            id: self.id,
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            action: self.action,
            data: self.data.clone(),
            timestamp: self.timestamp,
            originating_user_id: user_id.to_string(),
            version: 0,
            checksum: crate::checksum::payload_checksum(self.data.as_ref()),
        }
    }
}
