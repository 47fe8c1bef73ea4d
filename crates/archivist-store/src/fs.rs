use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use archivist_types::ArchiveKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{ArchiveStorage, StorageBackend};

/// Name of the manifest file inside each archive directory.
pub const MANIFEST_FILE: &str = "archive.json";

const MANIFEST_VERSION: u32 = 1;

/// Identity record written into every archive directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub key: ArchiveKey,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    fn new(key: ArchiveKey) -> Self {
        Self {
            version: MANIFEST_VERSION,
            key,
            created_at: Utc::now(),
        }
    }

    /// Read the manifest in `dir`. Returns `Ok(None)` if there is none yet.
    pub async fn read(dir: &Path) -> StoreResult<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Manifest {
                path,
                reason: e.to_string(),
            })
    }

    async fn write(&self, dir: &Path) -> StoreResult<()> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        // Write-then-rename so a crash never leaves a truncated manifest.
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Directory-per-archive storage backend.
#[derive(Clone, Debug, Default)]
pub struct FsStorageBackend;

impl FsStorageBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for FsStorageBackend {
    async fn open(&self, key: &ArchiveKey, dir: &Path) -> StoreResult<Box<dyn ArchiveStorage>> {
        tokio::fs::create_dir_all(dir).await?;
        debug!(key = %key, dir = %dir.display(), "opened archive directory");
        Ok(Box::new(FsStorage {
            key: *key,
            dir: dir.to_path_buf(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Storage handle for one archive directory.
#[derive(Debug)]
pub struct FsStorage {
    key: ArchiveKey,
    dir: PathBuf,
    closed: AtomicBool,
}

impl FsStorage {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArchiveStorage for FsStorage {
    fn key(&self) -> &ArchiveKey {
        &self.key
    }

    async fn ready(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.key));
        }
        match Manifest::read(&self.dir).await? {
            Some(manifest) if manifest.key != self.key => Err(StoreError::KeyMismatch {
                expected: self.key,
                found: manifest.key,
            }),
            Some(_) => Ok(()),
            None => Manifest::new(self.key).write(&self.dir).await,
        }
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(key = %self.key, "closed archive storage");
        }
        Ok(())
    }
}
