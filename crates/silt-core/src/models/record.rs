//! Audit log record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::{EntityPayload, EntityType};

/// A unique identifier for a sync record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of mutation a sync record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for SyncAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown sync action: {other}"
            ))),
        }
    }
}

/// One accepted mutation in the append-only audit log
///
/// Never mutated or deleted once appended; `version` increases
/// monotonically per `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    /// Entity payload; None for DELETE
    pub data: Option<EntityPayload>,
    /// When the mutation happened (unix ms)
    pub timestamp: i64,
    pub originating_user_id: String,
    /// Server-assigned; clients submit 0 and the server stamps the real one
    pub version: i64,
    /// Content hash of `data`
    pub checksum: String,
}

impl SyncRecord {
    /// Validate internal consistency of a record before it is applied
    pub fn validate(&self) -> crate::Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "entity_id must not be empty".to_string(),
            ));
        }
        match (&self.action, &self.data) {
            (SyncAction::Delete, _) => Ok(()),
            (_, None) => Err(crate::Error::InvalidInput(format!(
                "{} record for {} is missing a payload",
                self.action.as_str(),
                self.entity_id
            ))),
            (_, Some(payload)) => {
                if payload.matches_type(self.entity_type) {
                    Ok(())
                } else {
                    Err(crate::Error::PayloadMismatch {
                        expected: self.entity_type.to_string(),
                        actual: payload.entity_type().to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::entity::TaskPayload;
    use super::*;

    fn record(action: SyncAction, data: Option<EntityPayload>) -> SyncRecord {
        SyncRecord {
            id: RecordId::new(),
            entity_type: EntityType::Task,
            entity_id: "t-1".to_string(),
            action,
            data,
            timestamp: 1_700_000_000_000,
            originating_user_id: "user-a".to_string(),
            version: 0,
            checksum: String::new(),
        }
    }

    fn task_payload() -> EntityPayload {
        EntityPayload::Task(TaskPayload {
            title: "x".to_string(),
            notes: None,
            done: false,
            project_id: None,
            due_at: None,
        })
    }

    #[test]
    fn test_record_id_unique() {
        assert_ne!(RecordId::new(), RecordId::new());
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        let parsed: RecordId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn delete_needs_no_payload() {
        assert!(record(SyncAction::Delete, None).validate().is_ok());
    }

    #[test]
    fn create_requires_payload() {
        assert!(record(SyncAction::Create, None).validate().is_err());
        assert!(record(SyncAction::Create, Some(task_payload()))
            .validate()
            .is_ok());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let mut rec = record(SyncAction::Update, Some(task_payload()));
        rec.entity_type = EntityType::Project;
        assert!(matches!(
            rec.validate(),
            Err(crate::Error::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn action_wire_form_is_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&SyncAction::Create).unwrap(),
            "\"CREATE\""
        );
        let parsed: SyncAction = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(parsed, SyncAction::Delete);
    }
}
