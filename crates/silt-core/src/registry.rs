//! Entity sync configuration registry
//!
//! Built once at startup and passed by reference into the sync service;
//! there is no process-wide mutable registry. An entity type with no
//! entry here is skipped on pull and rejected on push.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{EntityPayload, EntityType};
use crate::{Error, Result};

/// Static sync configuration for one entity type
#[derive(Debug, Clone)]
pub struct EntitySyncConfig {
    pub entity_type: EntityType,
    /// Storage table backing this entity type
    pub table: &'static str,
    /// Wire field names stripped from outgoing payloads (secrets etc.)
    pub excluded_fields: &'static [&'static str],
    /// Related entity types pulled alongside this one
    pub include_related: &'static [EntityType],
    /// Whether DELETE marks rows instead of removing them
    pub soft_delete: bool,
}

/// Registry of all entity types this deployment syncs
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    configs: BTreeMap<EntityType, EntitySyncConfig>,
}

impl EntityRegistry {
    pub fn new(configs: impl IntoIterator<Item = EntitySyncConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|config| (config.entity_type, config))
                .collect(),
        }
    }

    /// Registry with every entity type this build knows about
    #[must_use]
    pub fn standard() -> Self {
        Self::new([
            EntitySyncConfig {
                entity_type: EntityType::Task,
                table: "tasks",
                excluded_fields: &[],
                include_related: &[EntityType::Project],
                soft_delete: true,
            },
            EntitySyncConfig {
                entity_type: EntityType::Project,
                table: "projects",
                excluded_fields: &[],
                include_related: &[],
                soft_delete: true,
            },
            EntitySyncConfig {
                entity_type: EntityType::UserProfile,
                table: "user_profiles",
                excluded_fields: &["apiToken"],
                include_related: &[],
                soft_delete: false,
            },
        ])
    }

    #[must_use]
    pub fn get(&self, entity_type: EntityType) -> Option<&EntitySyncConfig> {
        self.configs.get(&entity_type)
    }

    #[must_use]
    pub fn is_registered(&self, entity_type: EntityType) -> bool {
        self.configs.contains_key(&entity_type)
    }

    pub fn registered_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.configs.keys().copied()
    }

    /// Drop excluded fields from a payload before it leaves the server
    pub fn strip_excluded(&self, payload: &EntityPayload) -> Result<EntityPayload> {
        let config = self
            .get(payload.entity_type())
            .ok_or_else(|| Error::UnregisteredEntityType(payload.entity_type().to_string()))?;
        if config.excluded_fields.is_empty() {
            return Ok(payload.clone());
        }

        let mut value = serde_json::to_value(payload)?;
        if let Value::Object(map) = &mut value {
            for field in config.excluded_fields {
                map.remove(*field);
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::UserProfilePayload;

    #[test]
    fn standard_registry_covers_all_types() {
        let registry = EntityRegistry::standard();
        for entity_type in EntityType::ALL {
            assert!(registry.is_registered(entity_type), "{entity_type} missing");
        }
    }

    #[test]
    fn strip_excluded_removes_api_token() {
        let registry = EntityRegistry::standard();
        let payload = EntityPayload::UserProfile(UserProfilePayload {
            display_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            timezone: Some("UTC".to_string()),
            api_token: Some("secret".to_string()),
        });

        let stripped = registry.strip_excluded(&payload).unwrap();
        let EntityPayload::UserProfile(profile) = stripped else {
            panic!("variant changed");
        };
        assert_eq!(profile.api_token, None);
        assert_eq!(profile.display_name, "Ada");
    }

    #[test]
    fn partial_registry_leaves_types_unregistered() {
        let registry = EntityRegistry::new([EntitySyncConfig {
            entity_type: EntityType::Task,
            table: "tasks",
            excluded_fields: &[],
            include_related: &[],
            soft_delete: true,
        }]);
        assert!(registry.is_registered(EntityType::Task));
        assert!(!registry.is_registered(EntityType::Project));
    }
}
