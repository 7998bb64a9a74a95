//! Conflict records and resolution strategies

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::entity::{EntityPayload, EntityType};
use super::record::RecordId;

/// Client-surfaced record of a push rejected with reason CONFLICT
///
/// The id is the rejected sync record's id; removed once the conflict is
/// resolved through the resolution protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub server_data: Option<EntityPayload>,
    pub local_data: Option<EntityPayload>,
    /// When the conflict was detected (unix ms)
    pub timestamp: i64,
}

/// How a conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Keep server state; the client re-pulls to refresh its cache
    ServerWins,
    /// Re-apply the rejected client payload as a new mutation
    ClientWins,
    /// Apply caller-supplied merged data as a new mutation
    Merge,
}

impl ResolutionStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "SERVER_WINS",
            Self::ClientWins => "CLIENT_WINS",
            Self::Merge => "MERGE",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SERVER_WINS" => Ok(Self::ServerWins),
            "CLIENT_WINS" => Ok(Self::ClientWins),
            "MERGE" => Ok(Self::Merge),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown resolution strategy: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_wire_form() {
        assert_eq!(
            serde_json::to_string(&ResolutionStrategy::ClientWins).unwrap(),
            "\"CLIENT_WINS\""
        );
        let parsed: ResolutionStrategy = "MERGE".parse().unwrap();
        assert_eq!(parsed, ResolutionStrategy::Merge);
        assert!("COIN_FLIP".parse::<ResolutionStrategy>().is_err());
    }
}
