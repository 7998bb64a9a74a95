//! silt-core - Core library for Silt
//!
//! This crate contains the shared models, wire protocol types, and the
//! entity sync registry used by both halves of the engine (client and
//! server). It performs no I/O.

pub mod checksum;
pub mod error;
pub mod models;
pub mod protocol;
pub mod registry;

pub use error::{Error, Result};
pub use models::{
    ConflictRecord, EntityPayload, EntityType, PendingMutation, RecordId, ResolutionStrategy,
    SyncAction, SyncRecord, SyncStatus, SyncToken,
};
pub use registry::{EntityRegistry, EntitySyncConfig};
