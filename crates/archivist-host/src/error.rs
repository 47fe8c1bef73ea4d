use std::fmt;
use std::sync::Arc;

use archivist_store::StoreError;
use archivist_types::ArchiveKey;
use thiserror::Error;

/// Which part of closing an archive failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStep {
    /// Destroying streams or leaving the swarm.
    Replication,
    /// Closing the storage handle.
    Storage,
}

impl fmt::Display for CloseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replication => f.write_str("replication"),
            Self::Storage => f.write_str("storage"),
        }
    }
}

/// Errors from archive lifecycle operations.
///
/// `Clone` so one load outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// Opening or readying the archive's storage failed. Every caller
    /// waiting on that load receives this; the key can be loaded again.
    #[error("failed to open storage for {key}: {source}")]
    StorageOpen {
        key: ArchiveKey,
        source: Arc<StoreError>,
    },

    /// A step of closing the archive failed. The archive is still removed
    /// from the registry.
    #[error("failed to close {key} ({step}): {reason}")]
    Close {
        key: ArchiveKey,
        step: CloseStep,
        reason: String,
    },

    /// The background task running a load or close did not complete.
    #[error("lifecycle task for {key} failed: {reason}")]
    TaskFailed { key: ArchiveKey, reason: String },

    /// An archive source produced an unusable record.
    #[error("invalid archive record: {0}")]
    InvalidRecord(String),

    /// The account record backend failed.
    #[error("record store error: {0}")]
    Records(String),
}

impl HostError {
    pub(crate) fn storage_open(key: ArchiveKey, source: StoreError) -> Self {
        Self::StorageOpen {
            key,
            source: Arc::new(source),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
