use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("data file not found = {0}")]
    DataFileNotFound(PathBuf),

    #[error("Corrupted index: {0}")]
    CorruptIndex(String),

    #[error("No usable index at {0} and building is disallowed")]
    IndexMissing(PathBuf),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollectionError {
    /// Returns true when the only way forward is a full rebuild of the index.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, Self::CorruptIndex(_))
    }
}

pub type Result<T> = std::result::Result<T, CollectionError>;
