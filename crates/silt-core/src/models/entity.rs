//! Syncable entity types and their typed payloads

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered category of syncable data
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Project,
    UserProfile,
}

impl EntityType {
    /// All entity types known to this build
    pub const ALL: [Self; 3] = [Self::Task, Self::Project, Self::UserProfile];

    /// Stable string form used on the wire and in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::UserProfile => "user_profile",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "project" => Ok(Self::Project),
            "user_profile" => Ok(Self::UserProfile),
            other => Err(crate::Error::UnregisteredEntityType(other.to_string())),
        }
    }
}

/// Entity payload as carried by sync records
///
/// Tagged union keyed by entity type: the wire format stays polymorphic
/// while each variant keeps its own typed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "snake_case")]
pub enum EntityPayload {
    Task(TaskPayload),
    Project(ProjectPayload),
    UserProfile(UserProfilePayload),
}

impl EntityPayload {
    /// Entity type this payload belongs to
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Task(_) => EntityType::Task,
            Self::Project(_) => EntityType::Project,
            Self::UserProfile(_) => EntityType::UserProfile,
        }
    }

    /// Check the payload variant against the type a record claims
    #[must_use]
    pub fn matches_type(&self, entity_type: EntityType) -> bool {
        self.entity_type() == entity_type
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Due date (unix ms)
    #[serde(default)]
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfilePayload {
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Per-user API credential; excluded from sync payloads by the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

/// Sync state of a locally cached entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown sync status: {other}"
            ))),
        }
    }
}

/// Client-side mirror of a server entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: EntityPayload,
    pub sync_status: SyncStatus,
    /// When this entity was last confirmed in sync with the server (unix ms)
    pub last_synced_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn task() -> EntityPayload {
        EntityPayload::Task(TaskPayload {
            title: "Write report".to_string(),
            notes: None,
            done: false,
            project_id: Some("p-1".to_string()),
            due_at: None,
        })
    }

    #[test]
    fn payload_is_tagged_by_entity_type() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["entityType"], "task");
        assert_eq!(json["title"], "Write report");

        let back: EntityPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, task());
    }

    #[test]
    fn payload_matches_its_type() {
        assert!(task().matches_type(EntityType::Task));
        assert!(!task().matches_type(EntityType::Project));
    }

    #[test]
    fn entity_type_round_trips_through_str() {
        for entity_type in EntityType::ALL {
            let parsed: EntityType = entity_type.as_str().parse().unwrap();
            assert_eq!(parsed, entity_type);
        }
        assert!("gadget".parse::<EntityType>().is_err());
    }

    #[test]
    fn user_profile_token_is_optional_on_the_wire() {
        let profile = EntityPayload::UserProfile(UserProfilePayload {
            display_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            timezone: None,
            api_token: None,
        });
        let json = serde_json::to_value(&profile).unwrap();
        assert!(json.get("apiToken").is_none());
    }
}
