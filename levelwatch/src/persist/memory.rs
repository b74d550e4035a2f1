use crate::{
    persist::{PersistError, SnapshotStore},
    session::UserId,
};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory [`SnapshotStore`] used by tests.
///
/// `set_failing` makes every operation error until cleared, for exercising the
/// flush worker's retry path.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    blobs: Mutex<FnvHashMap<String, Vec<u8>>>,
    archived: Mutex<FnvHashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Test helper: direct read of the stored blob.
    pub fn blob(&self, user_id: &UserId) -> Option<Vec<u8>> {
        self.blobs.lock().get(user_id.as_str()).cloned()
    }

    /// Test helper: direct read of an archived blob.
    pub fn archived_blob(&self, user_id: &UserId) -> Option<Vec<u8>> {
        self.archived.lock().get(user_id.as_str()).cloned()
    }

    fn check_available(&self) -> Result<(), PersistError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistError::Unavailable("store marked failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, user_id: &UserId, bytes: Vec<u8>) -> Result<(), PersistError> {
        self.check_available()?;
        self.blobs.lock().insert(user_id.as_str().to_string(), bytes);
        Ok(())
    }

    async fn load(&self, user_id: &UserId) -> Result<Option<Vec<u8>>, PersistError> {
        self.check_available()?;
        Ok(self.blobs.lock().get(user_id.as_str()).cloned())
    }

    async fn delete(&self, user_id: &UserId) -> Result<(), PersistError> {
        self.check_available()?;
        self.blobs.lock().remove(user_id.as_str());
        Ok(())
    }

    async fn archive(&self, user_id: &UserId) -> Result<(), PersistError> {
        self.check_available()?;
        if let Some(blob) = self.blobs.lock().remove(user_id.as_str()) {
            self.archived
                .lock()
                .insert(user_id.as_str().to_string(), blob);
        }
        Ok(())
    }
}
