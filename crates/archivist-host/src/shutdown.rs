use std::sync::Arc;

use archivist_types::ArchiveKey;
use futures::future::{join_all, FutureExt};
use tracing::{info, warn};

use crate::error::{CloseStep, HostError, HostResult};
use crate::events::RegistryEvent;
use crate::handle::ArchiveHandle;
use crate::registry::{ArchiveRegistry, CloseFuture, Inner, Pending, Slot};

/// Outcome of [`ArchiveRegistry::close_all_archives`].
#[derive(Clone, Debug, Default)]
pub struct CloseReport {
    pub closed: Vec<ArchiveKey>,
    pub failed: Vec<(ArchiveKey, HostError)>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Inner {
    /// Tear down replication, then storage, then forget the key. The key is
    /// removed even if a step fails; the first failure is returned.
    async fn run_close(&self, handle: Arc<ArchiveHandle>) -> HostResult<()> {
        let key = *handle.key();
        let replication = handle.replication().shutdown().await;
        let storage = handle.storage().close().await;

        self.slots().remove(&key);
        self.emit(RegistryEvent::Closed { key });

        if let Err(e) = &replication {
            warn!(key = %key, error = %e, "replication shutdown failed");
        }
        if let Err(e) = &storage {
            warn!(key = %key, error = %e, "storage close failed");
        }
        replication.map_err(|e| HostError::Close {
            key,
            step: CloseStep::Replication,
            reason: e.to_string(),
        })?;
        storage.map_err(|e| HostError::Close {
            key,
            step: CloseStep::Storage,
            reason: e.to_string(),
        })?;
        info!(key = %key, "archive closed");
        Ok(())
    }
}

impl ArchiveRegistry {
    /// Close `key` and remove it from the registry.
    ///
    /// Closing an absent key succeeds. A key that is still loading is closed
    /// once its load settles; if the load fails there is nothing to close.
    /// Concurrent closes of one key share a single teardown.
    pub async fn close_archive(&self, key: &ArchiveKey) -> HostResult<()> {
        loop {
            let pending = {
                let mut slots = self.inner.slots();
                match slots.get(key) {
                    None => return Ok(()),
                    Some(Slot::Loading(load)) => Pending::Load(load.clone()),
                    Some(Slot::Closing(close)) => Pending::Close(close.clone()),
                    Some(Slot::Resident(handle)) => {
                        let close = self.start_close(Arc::clone(handle));
                        slots.insert(*key, Slot::Closing(close.clone()));
                        Pending::Close(close)
                    }
                }
            };
            match pending {
                Pending::Load(load) => {
                    // Success or failure, the slot has moved on; look again.
                    let _ = load.await;
                }
                Pending::Close(close) => return close.await,
            }
        }
    }

    fn start_close(&self, handle: Arc<ArchiveHandle>) -> CloseFuture {
        let key = *handle.key();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_close(handle).await });
        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let mut slots = inner.slots();
                    if matches!(slots.get(&key), Some(Slot::Closing(_))) {
                        slots.remove(&key);
                    }
                    Err(HostError::TaskFailed {
                        key,
                        reason: e.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Close every archive the registry knows about, resident or loading,
    /// concurrently. One archive failing does not stop the others.
    pub async fn close_all_archives(&self) -> CloseReport {
        let keys: Vec<ArchiveKey> = self.inner.slots().keys().copied().collect();
        let results = join_all(keys.iter().map(|key| self.close_archive(key))).await;

        let mut report = CloseReport::default();
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(()) => report.closed.push(key),
                Err(e) => report.failed.push((key, e)),
            }
        }
        info!(
            closed = report.closed.len(),
            failed = report.failed.len(),
            "closed all archives"
        );
        report
    }
}
