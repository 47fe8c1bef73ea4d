use std::path::PathBuf;

use archivist_sync::CompletionBarrier;
use archivist_types::ArchiveKey;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{HostError, HostResult};
use crate::registry::ArchiveRegistry;

/// One archive a source says should be hosted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub key: ArchiveKey,
}

impl From<ArchiveKey> for ArchiveRecord {
    fn from(key: ArchiveKey) -> Self {
        Self { key }
    }
}

/// Somewhere the set of hosted archives can be read from at startup.
pub trait ArchiveSource: Send + Sync {
    /// Every record, read lazily. Errors for individual records do not end
    /// the stream.
    fn list(&self) -> BoxStream<'_, HostResult<ArchiveRecord>>;
}

/// A fixed list of records.
#[derive(Clone, Debug, Default)]
pub struct StaticSource {
    records: Vec<ArchiveRecord>,
}

impl StaticSource {
    pub fn new(keys: impl IntoIterator<Item = ArchiveKey>) -> Self {
        Self {
            records: keys.into_iter().map(ArchiveRecord::from).collect(),
        }
    }
}

impl ArchiveSource for StaticSource {
    fn list(&self) -> BoxStream<'_, HostResult<ArchiveRecord>> {
        stream::iter(self.records.iter().cloned().map(Ok)).boxed()
    }
}

/// Archives already present under a storage root: each subdirectory named
/// by a hex key is one record. Other entries are ignored.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArchiveSource for DirectorySource {
    fn list(&self) -> BoxStream<'_, HostResult<ArchiveRecord>> {
        if !self.root.exists() {
            return stream::empty().boxed();
        }
        let entries = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(HostError::InvalidRecord(e.to_string()))),
                };
                if !entry.file_type().is_dir() {
                    return None;
                }
                let name = entry.file_name().to_string_lossy();
                match ArchiveKey::from_hex(&name) {
                    Ok(key) => Some(Ok(ArchiveRecord { key })),
                    Err(_) => {
                        debug!(path = %entry.path().display(), "skipping non-archive directory");
                        None
                    }
                }
            });
        stream::iter(entries).boxed()
    }
}

/// Totals from one bootstrap run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub loaded: usize,
    pub failed: usize,
}

/// Load every archive `source` lists, then set `done` with the totals.
///
/// Records are loaded one at a time. A record that cannot be read or loaded
/// is logged and counted; it never stops the run.
pub async fn bootstrap(
    registry: &ArchiveRegistry,
    source: &dyn ArchiveSource,
    done: &CompletionBarrier<BootstrapReport>,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();
    let mut records = source.list();
    while let Some(record) = records.next().await {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping unreadable archive record");
                report.failed += 1;
                continue;
            }
        };
        match registry.load_archive(&record.key).await {
            Ok(_) => report.loaded += 1,
            Err(e) => {
                warn!(key = %record.key, error = %e, "bootstrap load failed");
                report.failed += 1;
            }
        }
    }

    info!(loaded = report.loaded, failed = report.failed, "bootstrap complete");
    if done.set(report).is_err() {
        warn!("bootstrap barrier was already set");
    }
    report
}
