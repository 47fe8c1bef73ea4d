use std::fmt;
use std::sync::Arc;

use archivist_store::ArchiveStorage;
use archivist_swarm::Replication;
use archivist_types::ArchiveKey;
use chrono::{DateTime, Utc};

/// A resident archive: its open storage plus its replication state.
///
/// Handles are shared; every caller that loads the same key while it stays
/// resident receives the same `Arc<ArchiveHandle>`.
pub struct ArchiveHandle {
    key: ArchiveKey,
    storage: Box<dyn ArchiveStorage>,
    replication: Arc<Replication>,
    loaded_at: DateTime<Utc>,
}

impl ArchiveHandle {
    pub(crate) fn new(
        key: ArchiveKey,
        storage: Box<dyn ArchiveStorage>,
        replication: Arc<Replication>,
    ) -> Self {
        Self {
            key,
            storage,
            replication,
            loaded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    pub fn storage(&self) -> &dyn ArchiveStorage {
        self.storage.as_ref()
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn stream_count(&self) -> usize {
        self.replication.stream_count()
    }

    /// Whether the archive joined the swarm when it was loaded.
    pub fn is_replicating(&self) -> bool {
        self.replication.is_joined()
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("key", &self.key.short_id())
            .field("streams", &self.replication.stream_count())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}
