use crate::{
    persist::{PersistError, SnapshotStore},
    session::UserId,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// [`SnapshotStore`] backed by one JSON blob file per user.
///
/// Writes go through a sibling temp file and an atomic rename, so a crash
/// mid-write can never leave a torn snapshot behind.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, user_id: &UserId) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(user_id.as_str())))
    }
}

/// Restrict user ids to filesystem-safe characters.
fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, user_id: &UserId, bytes: Vec<u8>) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path(user_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(user = %user_id, path = %path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    async fn load(&self, user_id: &UserId) -> Result<Option<Vec<u8>>, PersistError> {
        match tokio::fs::read(self.path(user_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(PersistError::Io(error)),
        }
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), PersistError> {
        match tokio::fs::remove_file(self.path(user_id)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(PersistError::Io(error)),
        }
    }

    async fn archive(&self, user_id: &UserId) -> Result<(), PersistError> {
        let path = self.path(user_id);
        let quarantine = path.with_extension("json.quarantine");
        match tokio::fs::rename(&path, &quarantine).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(PersistError::Io(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    #[tokio::test]
    async fn test_save_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let user = user("bhavesh");

        assert!(store.load(&user).await.unwrap().is_none());

        store.save(&user, b"v1".to_vec()).await.unwrap();
        assert_eq!(store.load(&user).await.unwrap(), Some(b"v1".to_vec()));

        // Last writer wins; full replacement
        store.save(&user, b"v2".to_vec()).await.unwrap();
        assert_eq!(store.load(&user).await.unwrap(), Some(b"v2".to_vec()));

        store.delete(&user).await.unwrap();
        assert!(store.load(&user).await.unwrap().is_none());
        // Deleting again is fine
        store.delete(&user).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_moves_blob_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let user = user("bhavesh");

        store.save(&user, b"corrupt".to_vec()).await.unwrap();
        store.archive(&user).await.unwrap();

        assert!(store.load(&user).await.unwrap().is_none());
        let archived = dir.path().join("bhavesh.json.quarantine");
        assert_eq!(std::fs::read(archived).unwrap(), b"corrupt");
    }

    #[tokio::test]
    async fn test_unsafe_user_ids_are_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let user = user("../../etc/passwd");

        store.save(&user, b"x".to_vec()).await.unwrap();
        assert_eq!(store.load(&user).await.unwrap(), Some(b"x".to_vec()));

        // The blob landed inside the snapshot dir
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
