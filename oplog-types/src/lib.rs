//! Core type definitions for the operation log.
//!
//! This crate defines the identifiers every other crate in the workspace
//! depends on:
//! - Operation identifiers (UUID v7, time-ordered)
//! - Client (replica) and entity identifiers
//! - Entity types and `TYPE:id` entity keys
//! - Wall-clock helpers
//!
//! Domain payloads stay opaque JSON; nothing here knows what a task or a
//! project looks like.

mod entity;
mod ids;
mod timestamp;

pub use entity::{EntityKey, EntityType};
pub use ids::{ClientId, EntityId, OpId};
pub use timestamp::{now_millis, HOUR_MS};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),
}
