use std::path::Path;

use archivist_types::ArchiveKey;
use async_trait::async_trait;

use crate::error::StoreResult;

/// Factory for per-archive storage handles.
///
/// Implementations must tolerate `dir` already existing and must not assume
/// they are the only backend instance in the process.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open (or create) the storage for `key` rooted at `dir`.
    ///
    /// The returned handle is not usable until [`ArchiveStorage::ready`]
    /// resolves.
    async fn open(&self, key: &ArchiveKey, dir: &Path) -> StoreResult<Box<dyn ArchiveStorage>>;
}

/// An opened archive's storage.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    /// Key of the archive this storage holds.
    fn key(&self) -> &ArchiveKey;

    /// Suspend until the backend reports the storage ready for use.
    async fn ready(&self) -> StoreResult<()>;

    /// Flush and release the storage. Closing twice is not an error.
    async fn close(&self) -> StoreResult<()>;
}
