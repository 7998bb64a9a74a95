//! Sync token model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entity::EntityType;

/// Client's claim of its sync state
///
/// Produced by the server after every pull or push; the client persists
/// it and resubmits it on every push so the server can detect conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncToken {
    pub user_id: String,
    /// Last server timestamp the client has synced through (unix ms)
    pub last_sync_timestamp: i64,
    /// Highest audit-log version the client has observed per entity type
    #[serde(default)]
    pub entity_versions: BTreeMap<EntityType, i64>,
}

impl SyncToken {
    /// Fresh token for a client that has never synced
    #[must_use]
    pub fn initial(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            last_sync_timestamp: 0,
            entity_versions: BTreeMap::new(),
        }
    }

    /// Version the client claims to have seen for an entity type (0 if none)
    #[must_use]
    pub fn claimed_version(&self, entity_type: EntityType) -> i64 {
        self.entity_versions.get(&entity_type).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn initial_token_claims_nothing() {
        let token = SyncToken::initial("user-a");
        assert_eq!(token.last_sync_timestamp, 0);
        assert_eq!(token.claimed_version(EntityType::Task), 0);
    }

    #[test]
    fn token_round_trips_as_json() {
        let mut token = SyncToken::initial("user-a");
        token.entity_versions.insert(EntityType::Task, 3);
        token.last_sync_timestamp = 42;

        let json = serde_json::to_string(&token).unwrap();
        let back: SyncToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
        assert_eq!(back.claimed_version(EntityType::Task), 3);
    }
}
