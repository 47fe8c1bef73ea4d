use std::path::PathBuf;

use archivist_types::ArchiveKey;

/// Errors from archive storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive manifest could not be read or written.
    #[error("bad manifest at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// The directory holds a different archive than the one requested.
    #[error("directory holds archive {found}, expected {expected}")]
    KeyMismatch {
        expected: ArchiveKey,
        found: ArchiveKey,
    },

    /// The storage handle was already closed.
    #[error("storage for {0} is closed")]
    Closed(ArchiveKey),

    /// Failure injected by [`InMemoryStorageBackend`](crate::InMemoryStorageBackend).
    #[error("injected {phase} failure for {key}")]
    Injected {
        key: ArchiveKey,
        phase: &'static str,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
