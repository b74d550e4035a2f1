use crate::session::UserId;
use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

pub mod file;
pub mod memory;
pub mod worker;

/// Durable blob store for serialised session snapshots, keyed by stable user
/// id.
///
/// Contract: `save` is idempotent and last-writer-wins per user; each snapshot
/// is a full replacement, never a partial write. The blob content is opaque to
/// the store - versioning lives in the session snapshot codec.
#[async_trait]
pub trait SnapshotStore
where
    Self: Debug + Send + Sync,
{
    async fn save(&self, user_id: &UserId, bytes: Vec<u8>) -> Result<(), PersistError>;

    async fn load(&self, user_id: &UserId) -> Result<Option<Vec<u8>>, PersistError>;

    async fn delete(&self, user_id: &UserId) -> Result<(), PersistError>;

    /// Move a corrupt snapshot aside for diagnosis instead of deleting it.
    async fn archive(&self, user_id: &UserId) -> Result<(), PersistError>;
}

/// All persistence related errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialise snapshot: {0}")]
    Serialise(serde_json::Error),

    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u8),

    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}
