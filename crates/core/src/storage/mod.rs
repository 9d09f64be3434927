//! Object storage for uploaded recordings.

mod fs;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::StageError;

pub use fs::FsStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        match e {
            // Retrying cannot make a missing or malformed object appear
            StorageError::NotFound(_) | StorageError::InvalidKey(_) => {
                StageError::fatal(e.to_string())
            }
            StorageError::Io(_) => StageError::retryable(e.to_string()),
        }
    }
}

/// Key-addressed blob storage.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Copy an object to a local file. Returns the number of bytes written.
    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;

    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Returns whether an object was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}
