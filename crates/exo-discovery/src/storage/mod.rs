//! "Last used backend" persistence.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("No storage location available")]
    NoLocation,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Remembers which backend was used last.
#[async_trait]
pub trait LastUsedStore: Send + Sync {
    /// Identity of the last used backend, if any.
    async fn load(&self) -> Result<Option<String>, StorageError>;

    /// Record `id` as the last used backend.
    async fn save(&self, id: &str) -> Result<(), StorageError>;
}
