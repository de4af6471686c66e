//! JSON file last-used store.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LastUsedStore, StorageError};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    last_used: String,
    updated_at: u64,
}

/// Store backed by a small JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/exo/last_backend.json`.
    ///
    /// # Errors
    /// Returns [`StorageError::NoLocation`] if the platform has no data dir.
    pub fn default_location() -> Result<Self, StorageError> {
        let dir = dirs::data_dir().ok_or(StorageError::NoLocation)?;
        Ok(Self::new(dir.join("exo").join("last_backend.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl LastUsedStore for FileStore {
    async fn load(&self) -> Result<Option<String>, StorageError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: Record = serde_json::from_slice(&raw)?;
        Ok(Some(record.last_used))
    }

    async fn save(&self, id: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = Record {
            last_used: id.to_string(),
            updated_at: now(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        // Write then rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), id, "Saved last used backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir()
            .join(format!("exo-store-{}", uuid::Uuid::new_v4()))
            .join("last_backend.json")
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let store = FileStore::new(scratch());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_creates_dirs_and_roundtrips() {
        let path = scratch();
        let store = FileStore::new(&path);
        store.save("c0ffee").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("c0ffee"));

        // A second store on the same file sees it too.
        assert_eq!(
            FileStore::new(&path).load().await.unwrap().as_deref(),
            Some("c0ffee")
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let path = scratch();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{oops").unwrap();
        assert!(matches!(
            FileStore::new(&path).load().await,
            Err(StorageError::Serialization(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
