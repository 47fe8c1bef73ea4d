use std::path::{Path, PathBuf};
use std::sync::Arc;

use archivist_store::{ArchiveStorage, StorageBackend, StoreError};
use archivist_types::ArchiveKey;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};

/// Opens archive storage under a root directory, one subdirectory per key.
#[derive(Clone)]
pub struct ArchiveLoader {
    root: PathBuf,
    backend: Arc<dyn StorageBackend>,
}

impl ArchiveLoader {
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `key`'s storage: `<root>/<hex key>`.
    pub fn archive_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.root.join(key.to_hex())
    }

    /// Open `key`'s storage and wait until it is ready.
    ///
    /// Storage that opens but never becomes ready is closed again before the
    /// error is returned, so a failed load leaves nothing open.
    pub async fn load(&self, key: &ArchiveKey) -> HostResult<Box<dyn ArchiveStorage>> {
        let dir = self.archive_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HostError::storage_open(*key, StoreError::Io(e)))?;

        let storage = self
            .backend
            .open(key, &dir)
            .await
            .map_err(|e| HostError::storage_open(*key, e))?;

        if let Err(e) = storage.ready().await {
            if let Err(close_err) = storage.close().await {
                warn!(key = %key, error = %close_err, "failed to close storage after ready failed");
            }
            return Err(HostError::storage_open(*key, e));
        }

        debug!(key = %key, dir = %dir.display(), "storage ready");
        Ok(storage)
    }
}

impl std::fmt::Debug for ArchiveLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveLoader")
            .field("root", &self.root)
            .finish()
    }
}
