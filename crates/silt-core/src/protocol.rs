//! Wire protocol types shared by the transport client and the server
//!
//! HTTP/JSON, versioned under `/v1`. Key response fields are echoed as
//! headers (see [`headers`]) so monitoring proxies can read them without
//! parsing bodies.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{
    EntityPayload, EntityType, RecordId, ResolutionStrategy, SyncRecord, SyncToken,
};

/// Response header names echoing key sync fields
pub mod headers {
    pub const SYNC_TIMESTAMP: &str = "x-sync-timestamp";
    pub const HAS_MORE: &str = "x-has-more";
    pub const ACCEPTED_COUNT: &str = "x-accepted-count";
    pub const REJECTED_COUNT: &str = "x-rejected-count";
}

/// Default pull page size when the caller does not specify one
pub const DEFAULT_PULL_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub records: Vec<SyncRecord>,
    pub sync_token: SyncToken,
    /// True iff the page was exactly `limit` long; re-pull to drain
    pub has_more: bool,
    /// Server clock at response time (unix ms)
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub records: Vec<SyncRecord>,
    pub sync_token: SyncToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted: Vec<RecordId>,
    pub rejected: Vec<RejectedRecord>,
    pub sync_token: SyncToken,
    pub server_timestamp: i64,
}

/// One record the server refused to apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    pub id: RecordId,
    pub reason: RejectReason,
    /// Present iff `reason` is CONFLICT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_data: Option<ConflictData>,
}

/// Why a pushed record was rejected
///
/// CONFLICT requires manual resolution; anything else is a plain failure
/// message the client may retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Conflict,
    Other(String),
}

impl RejectReason {
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Conflict => "CONFLICT",
            Self::Other(message) => message,
        }
    }
}

// On the wire the reason is a plain string: "CONFLICT" or the failure
// message verbatim.
impl Serialize for RejectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RejectReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("rejection reason must not be empty"));
        }
        Ok(if raw == "CONFLICT" {
            Self::Conflict
        } else {
            Self::Other(raw)
        })
    }
}

/// Version diff attached to CONFLICT rejections so the client can render one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub server_version: i64,
    pub client_version: i64,
    pub server_data: Option<EntityPayload>,
    pub client_data: Option<EntityPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub record_id: RecordId,
    pub strategy: ResolutionStrategy,
    /// Required for MERGE, ignored otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<EntityPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    #[serde(default)]
    pub last_sync_timestamp: Option<i64>,
    /// Comma-separated entity type filter; all registered types if absent
    #[serde(default)]
    pub entity_types: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PullQuery {
    /// Parse the comma-separated `entityTypes` filter
    pub fn parse_entity_types(&self) -> crate::Result<Option<Vec<EntityType>>> {
        let Some(raw) = self.entity_types.as_deref() else {
            return Ok(None);
        };
        let mut types = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            types.push(part.parse()?);
        }
        Ok(if types.is_empty() { None } else { Some(types) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub user_id: String,
    pub last_sync_timestamp: Option<i64>,
    /// Audit-log entries the caller has not pulled yet
    pub pending_changes: i64,
    pub is_online: bool,
    pub sync_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampResponse {
    /// RFC 3339 form of the server clock
    pub timestamp: String,
    /// Same instant in unix milliseconds
    pub unix_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reject_reason_wire_form() {
        let conflict = serde_json::to_string(&RejectReason::Conflict).unwrap();
        assert_eq!(conflict, "\"CONFLICT\"");

        let other: RejectReason = serde_json::from_str("\"validation failed\"").unwrap();
        assert_eq!(other, RejectReason::Other("validation failed".to_string()));
        assert!(!other.is_conflict());

        let back: RejectReason = serde_json::from_str(&conflict).unwrap();
        assert!(back.is_conflict());
    }

    #[test]
    fn pull_query_parses_type_filter() {
        let query = PullQuery {
            last_sync_timestamp: Some(10),
            entity_types: Some("task, project".to_string()),
            limit: Some(2),
        };
        let types = query.parse_entity_types().unwrap().unwrap();
        assert_eq!(types, vec![EntityType::Task, EntityType::Project]);

        let bad = PullQuery {
            last_sync_timestamp: None,
            entity_types: Some("task,widget".to_string()),
            limit: None,
        };
        assert!(bad.parse_entity_types().is_err());
    }

    #[test]
    fn empty_type_filter_means_all() {
        let query = PullQuery {
            last_sync_timestamp: None,
            entity_types: Some(" , ".to_string()),
            limit: None,
        };
        assert_eq!(query.parse_entity_types().unwrap(), None);
    }
}
