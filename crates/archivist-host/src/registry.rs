use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use archivist_swarm::{Replication, SwarmReplicator};
use archivist_types::ArchiveKey;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{HostError, HostResult};
use crate::events::{RegistryEvent, EVENT_CAPACITY};
use crate::handle::ArchiveHandle;
use crate::loader::ArchiveLoader;

/// An in-flight load. Every caller that asks for the key while it is
/// loading awaits a clone of the same future.
pub type LoadFuture = Shared<BoxFuture<'static, HostResult<Arc<ArchiveHandle>>>>;
pub(crate) type CloseFuture = Shared<BoxFuture<'static, HostResult<()>>>;

pub(crate) enum Slot {
    Loading(LoadFuture),
    Resident(Arc<ArchiveHandle>),
    Closing(CloseFuture),
}

/// Work another caller already started on a key.
pub(crate) enum Pending {
    Load(LoadFuture),
    Close(CloseFuture),
}

/// Where a key is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveState {
    Absent,
    Loading,
    Resident,
    Closing,
}

pub(crate) struct Inner {
    pub(crate) slots: Mutex<HashMap<ArchiveKey, Slot>>,
    pub(crate) loader: ArchiveLoader,
    pub(crate) replicator: SwarmReplicator,
    pub(crate) events: broadcast::Sender<RegistryEvent>,
}

impl Inner {
    pub(crate) fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ArchiveKey, Slot>> {
        self.slots.lock().expect("registry lock poisoned")
    }

    pub(crate) fn emit(&self, event: RegistryEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn run_load(&self, key: ArchiveKey) -> HostResult<Arc<ArchiveHandle>> {
        let result = self.open(key).await;
        match &result {
            Ok(handle) => {
                self.slots().insert(key, Slot::Resident(Arc::clone(handle)));
                info!(key = %key, replicating = handle.is_replicating(), "archive loaded");
                self.emit(RegistryEvent::Loaded {
                    key,
                    replicating: handle.is_replicating(),
                });
            }
            Err(e) => {
                self.slots().remove(&key);
                warn!(key = %key, error = %e, "archive load failed");
                self.emit(RegistryEvent::LoadFailed {
                    key,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    /// Open storage, then join the swarm. The handle is only published once
    /// both are done, so a close never sees a half-attached archive.
    async fn open(&self, key: ArchiveKey) -> HostResult<Arc<ArchiveHandle>> {
        let storage = self.loader.load(&key).await?;
        let replication = Arc::new(Replication::new(key));
        self.replicator.attach(&replication).await;
        Ok(Arc::new(ArchiveHandle::new(key, storage, replication)))
    }
}

/// The set of open archives, keyed by [`ArchiveKey`].
///
/// Loads are deduplicated: however many callers ask for a key, its storage
/// is opened once and all of them receive the same handle (or the same
/// error). Loads and closes run on their own tasks, so they complete even if
/// every caller stops waiting. Clones share the same registry.
#[derive(Clone)]
pub struct ArchiveRegistry {
    pub(crate) inner: Arc<Inner>,
}

impl ArchiveRegistry {
    pub fn new(loader: ArchiveLoader, replicator: SwarmReplicator) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                loader,
                replicator,
                events,
            }),
        }
    }

    /// Return the resident handle for `key`, loading it if needed.
    ///
    /// Joins an in-flight load rather than starting another. If the key is
    /// closing, waits for the close to finish and then loads it afresh.
    pub async fn load_archive(&self, key: &ArchiveKey) -> HostResult<Arc<ArchiveHandle>> {
        loop {
            let pending = {
                let mut slots = self.inner.slots();
                match slots.get(key) {
                    Some(Slot::Resident(handle)) => return Ok(Arc::clone(handle)),
                    Some(Slot::Loading(load)) => Pending::Load(load.clone()),
                    Some(Slot::Closing(close)) => Pending::Close(close.clone()),
                    None => {
                        let load = self.start_load(*key);
                        slots.insert(*key, Slot::Loading(load.clone()));
                        Pending::Load(load)
                    }
                }
            };
            match pending {
                Pending::Load(load) => return load.await,
                Pending::Close(close) => {
                    // Its outcome belongs to whoever asked for the close.
                    let _ = close.await;
                }
            }
        }
    }

    /// Spawn the load task. Called with the slot map locked; the task cannot
    /// settle the slot before the caller has inserted it.
    fn start_load(&self, key: ArchiveKey) -> LoadFuture {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_load(key).await });
        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let mut slots = inner.slots();
                    if matches!(slots.get(&key), Some(Slot::Loading(_))) {
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

    /// The resident handle for `key`, without loading.
    pub fn get_archive(&self, key: &ArchiveKey) -> Option<Arc<ArchiveHandle>> {
        match self.inner.slots().get(key) {
            Some(Slot::Resident(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Whether a load for `key` has started and not yet settled.
    pub fn is_loading_archive(&self, key: &ArchiveKey) -> bool {
        matches!(self.inner.slots().get(key), Some(Slot::Loading(_)))
    }

    pub fn archive_state(&self, key: &ArchiveKey) -> ArchiveState {
        match self.inner.slots().get(key) {
            None => ArchiveState::Absent,
            Some(Slot::Loading(_)) => ArchiveState::Loading,
            Some(Slot::Resident(_)) => ArchiveState::Resident,
            Some(Slot::Closing(_)) => ArchiveState::Closing,
        }
    }

    /// Keys of every resident archive, sorted.
    pub fn resident_keys(&self) -> Vec<ArchiveKey> {
        let mut keys: Vec<ArchiveKey> = self
            .inner
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resident(_)))
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    pub fn resident_count(&self) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Resident(_)))
            .count()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn loader(&self) -> &ArchiveLoader {
        &self.inner.loader
    }

    pub fn replicator(&self) -> &SwarmReplicator {
        &self.inner.replicator
    }
}

impl std::fmt::Debug for ArchiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveRegistry")
            .field("slots", &self.inner.slots().len())
            .field("loader", &self.inner.loader)
            .field("replicator", &self.inner.replicator)
            .finish()
    }
}
