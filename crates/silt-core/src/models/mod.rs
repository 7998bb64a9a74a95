//! Shared data models

mod conflict;
mod entity;
mod mutation;
mod record;
mod token;

pub use conflict::{ConflictRecord, ResolutionStrategy};
pub use entity::{
    CachedEntity, EntityPayload, EntityType, ProjectPayload, SyncStatus, TaskPayload,
    UserProfilePayload,
};
pub use mutation::PendingMutation;
pub use record::{RecordId, SyncAction, SyncRecord};
pub use token::SyncToken;
