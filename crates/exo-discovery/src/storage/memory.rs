//! In-memory last-used store.

use std::sync::RwLock;

use async_trait::async_trait;

use super::{LastUsedStore, StorageError};

/// In-memory store.
///
/// Useful for tests and one-shot runs. Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    last_used: RwLock<Option<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `id`.
    #[must_use]
    pub fn with_last_used(id: impl Into<String>) -> Self {
        Self {
            last_used: RwLock::new(Some(id.into())),
        }
    }
}

#[async_trait]
impl LastUsedStore for MemoryStore {
    async fn load(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .last_used
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, id: &str) -> Result<(), StorageError> {
        *self
            .last_used
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStore::new();
        assert_eq!(store.load().await.unwrap(), None);
        store.save("abc").await.unwrap();
        store.save("def").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("def"));
    }
}
