//! Which accounts host which archives.
//!
//! [`RecordStore`] keeps one [`AccountRecord`] per owner in a
//! [`RecordBackend`]. Every change is a read-modify-write across two awaits,
//! so changes are serialized through [`KeyedMutex`]es, one keyed by owner
//! and one by archive; unrelated changes run in parallel. Each change is
//! broadcast as a [`RecordEvent`], and [`spawn_record_listener`] turns
//! those events into registry loads and closes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use archivist_sync::KeyedMutex;
use archivist_types::ArchiveKey;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::bootstrap::{ArchiveRecord, ArchiveSource};
use crate::error::{HostError, HostResult};
use crate::events::EVENT_CAPACITY;
use crate::registry::ArchiveRegistry;

/// The archives one owner hosts, in the order they were added.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub owner: String,
    pub archives: Vec<ArchiveKey>,
}

impl AccountRecord {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            archives: Vec::new(),
        }
    }
}

/// A change to the account records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordEvent {
    ArchiveAdded {
        owner: String,
        key: ArchiveKey,
    },
    ArchiveRemoved {
        owner: String,
        key: ArchiveKey,
        /// Whether another owner still hosts the archive.
        still_hosted: bool,
    },
}

impl RecordEvent {
    pub fn key(&self) -> &ArchiveKey {
        match self {
            Self::ArchiveAdded { key, .. } | Self::ArchiveRemoved { key, .. } => key,
        }
    }
}

/// Storage for account records.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Returns `Ok(None)` if the owner has no record.
    async fn get(&self, owner: &str) -> HostResult<Option<AccountRecord>>;

    /// Create or replace the owner's record.
    async fn put(&self, record: AccountRecord) -> HostResult<()>;

    async fn list(&self) -> HostResult<Vec<AccountRecord>>;
}

/// Record backend that keeps everything in a map. Data is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryRecordBackend {
    records: RwLock<HashMap<String, AccountRecord>>,
}

impl MemoryRecordBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordBackend for MemoryRecordBackend {
    async fn get(&self, owner: &str) -> HostResult<Option<AccountRecord>> {
        let records = self
            .records
            .read()
            .map_err(|e| HostError::Records(format!("lock poisoned: {e}")))?;
        Ok(records.get(owner).cloned())
    }

    async fn put(&self, record: AccountRecord) -> HostResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|e| HostError::Records(format!("lock poisoned: {e}")))?;
        records.insert(record.owner.clone(), record);
        Ok(())
    }

    async fn list(&self) -> HostResult<Vec<AccountRecord>> {
        let records = self
            .records
            .read()
            .map_err(|e| HostError::Records(format!("lock poisoned: {e}")))?;
        let mut all: Vec<AccountRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.owner.cmp(&b.owner));
        Ok(all)
    }
}

/// Account records with serialized updates.
///
/// Changes to one owner never interleave, and neither do changes touching
/// one archive, so the `still_hosted` flag of a removal is exact: no other
/// owner can add the archive between the removal and that check.
pub struct RecordStore {
    backend: Arc<dyn RecordBackend>,
    owners: KeyedMutex<String>,
    archives: KeyedMutex<ArchiveKey>,
    events: broadcast::Sender<RecordEvent>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            owners: KeyedMutex::new(),
            archives: KeyedMutex::new(),
            events,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordBackend::new()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, owner: &str) -> HostResult<Option<AccountRecord>> {
        self.backend.get(owner).await
    }

    /// Add `key` to `owner`'s archives. Returns `false` if it was already
    /// there, in which case no event is sent.
    pub async fn add_archive(&self, owner: &str, key: ArchiveKey) -> HostResult<bool> {
        // Owner before archive, everywhere.
        let _owner = self.owners.acquire(owner.to_string()).await;
        let _archive = self.archives.acquire(key).await;

        let mut record = self
            .backend
            .get(owner)
            .await?
            .unwrap_or_else(|| AccountRecord::new(owner));
        if record.archives.contains(&key) {
            return Ok(false);
        }
        record.archives.push(key);
        self.backend.put(record).await?;

        debug!(owner = %owner, key = %key, "archive added to account");
        let _ = self.events.send(RecordEvent::ArchiveAdded {
            owner: owner.to_string(),
            key,
        });
        Ok(true)
    }

    /// Remove `key` from `owner`'s archives. Returns `false` if it was not
    /// there, in which case no event is sent.
    pub async fn remove_archive(&self, owner: &str, key: ArchiveKey) -> HostResult<bool> {
        let _owner = self.owners.acquire(owner.to_string()).await;
        let _archive = self.archives.acquire(key).await;

        let Some(mut record) = self.backend.get(owner).await? else {
            return Ok(false);
        };
        let before = record.archives.len();
        record.archives.retain(|k| k != &key);
        if record.archives.len() == before {
            return Ok(false);
        }
        self.backend.put(record).await?;

        let still_hosted = is_hosted(self.backend.as_ref(), &key).await?;
        debug!(owner = %owner, key = %key, still_hosted, "archive removed from account");
        let _ = self.events.send(RecordEvent::ArchiveRemoved {
            owner: owner.to_string(),
            key,
            still_hosted,
        });
        Ok(true)
    }

    /// Whether any owner hosts `key`.
    pub async fn is_hosted(&self, key: &ArchiveKey) -> HostResult<bool> {
        is_hosted(self.backend.as_ref(), key).await
    }
}

async fn is_hosted(backend: &dyn RecordBackend, key: &ArchiveKey) -> HostResult<bool> {
    let records = backend.list().await?;
    Ok(records.iter().any(|r| r.archives.contains(key)))
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("held_owners", &self.owners.held_keys())
            .field("held_archives", &self.archives.held_keys())
            .finish()
    }
}

impl ArchiveSource for RecordStore {
    /// Every hosted archive once, however many owners host it.
    fn list(&self) -> BoxStream<'_, HostResult<ArchiveRecord>> {
        stream::once(self.backend.list())
            .flat_map(|listed| {
                let records: Vec<HostResult<ArchiveRecord>> = match listed {
                    Ok(accounts) => accounts
                        .into_iter()
                        .flat_map(|a| a.archives)
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .map(|key| Ok(ArchiveRecord { key }))
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(records)
            })
            .boxed()
    }
}

/// Keep the registry in step with `records`: an archive is resident while
/// some owner hosts it and closed once none does.
///
/// Events only say which archive to look at. Each is handled on its own
/// task, which takes that archive's lock and then reads the records afresh,
/// so events for one archive handled out of order still settle on the
/// current state. When the record store is dropped the listener waits for
/// outstanding work and ends.
pub fn spawn_record_listener(registry: ArchiveRegistry, records: &RecordStore) -> JoinHandle<()> {
    let mut events = records.subscribe();
    let backend = Arc::clone(&records.backend);
    let locks: KeyedMutex<ArchiveKey> = KeyedMutex::new();

    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        tasks.spawn(reconcile(
                            registry.clone(),
                            Arc::clone(&backend),
                            locks.clone(),
                            *event.key(),
                        ));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "record listener fell behind, rechecking every archive");
                        match backend.list().await {
                            Ok(accounts) => {
                                let keys: BTreeSet<ArchiveKey> =
                                    accounts.into_iter().flat_map(|a| a.archives).collect();
                                for key in keys {
                                    tasks.spawn(reconcile(
                                        registry.clone(),
                                        Arc::clone(&backend),
                                        locks.clone(),
                                        key,
                                    ));
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to list account records"),
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "record reconcile task failed");
                    }
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "record reconcile task failed");
            }
        }
        info!("record listener stopped");
    })
}

/// Load or close `key` to match whether any owner currently hosts it.
async fn reconcile(
    registry: ArchiveRegistry,
    backend: Arc<dyn RecordBackend>,
    locks: KeyedMutex<ArchiveKey>,
    key: ArchiveKey,
) {
    let _guard = locks.acquire(key).await;
    match is_hosted(backend.as_ref(), &key).await {
        Ok(true) => {
            if let Err(e) = registry.load_archive(&key).await {
                warn!(key = %key, error = %e, "failed to load hosted archive");
            }
        }
        Ok(false) => {
            if let Err(e) = registry.close_archive(&key).await {
                warn!(key = %key, error = %e, "failed to close unhosted archive");
            }
        }
        Err(e) => warn!(key = %key, error = %e, "failed to read account records"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RegistryEvent;
    use crate::loader::ArchiveLoader;
    use archivist_store::InMemoryStorageBackend;
    use archivist_swarm::SwarmReplicator;
    use archivist_sync::CompletionBarrier;
    use std::sync::Mutex;

    fn registry(root: &std::path::Path) -> ArchiveRegistry {
        let loader = ArchiveLoader::new(root, Arc::new(InMemoryStorageBackend::new()));
        ArchiveRegistry::new(loader, SwarmReplicator::disabled())
    }

    /// Memory backend whose next `list` can be held open once armed.
    #[derive(Default)]
    struct GatedBackend {
        inner: MemoryRecordBackend,
        gate: Mutex<Option<(CompletionBarrier<()>, CompletionBarrier<()>)>>,
    }

    impl GatedBackend {
        /// Hold the next `list`. Returns barriers for "entered" and "release".
        fn arm(&self) -> (CompletionBarrier<()>, CompletionBarrier<()>) {
            let entered = CompletionBarrier::new();
            let release = CompletionBarrier::new();
            *self.gate.lock().expect("gate lock poisoned") =
                Some((entered.clone(), release.clone()));
            (entered, release)
        }
    }

    #[async_trait]
    impl RecordBackend for GatedBackend {
        async fn get(&self, owner: &str) -> HostResult<Option<AccountRecord>> {
            self.inner.get(owner).await
        }

        async fn put(&self, record: AccountRecord) -> HostResult<()> {
            self.inner.put(record).await
        }

        async fn list(&self) -> HostResult<Vec<AccountRecord>> {
            let gate = self.gate.lock().expect("gate lock poisoned").take();
            if let Some((entered, release)) = gate {
                entered.set(()).unwrap();
                release.wait().await;
            }
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn add_and_remove() {
        let store = RecordStore::in_memory();
        let key = ArchiveKey::generate();

        assert!(store.add_archive("alice", key).await.unwrap());
        assert!(!store.add_archive("alice", key).await.unwrap());
        assert_eq!(store.get("alice").await.unwrap().unwrap().archives, vec![key]);
        assert!(store.is_hosted(&key).await.unwrap());

        assert!(store.remove_archive("alice", key).await.unwrap());
        assert!(!store.remove_archive("alice", key).await.unwrap());
        assert!(!store.remove_archive("bob", key).await.unwrap());
        assert!(!store.is_hosted(&key).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_to_one_owner_are_not_lost() {
        let store = Arc::new(RecordStore::in_memory());
        let keys: Vec<ArchiveKey> = (0..32).map(|_| ArchiveKey::generate()).collect();

        let tasks: Vec<_> = keys
            .iter()
            .copied()
            .map(|key| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.add_archive("alice", key).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        let record = store.get("alice").await.unwrap().unwrap();
        assert_eq!(record.archives.len(), keys.len());
        for key in &keys {
            assert!(record.archives.contains(key));
        }
    }

    #[tokio::test]
    async fn events_track_changes() {
        let store = RecordStore::in_memory();
        let mut events = store.subscribe();
        let key = ArchiveKey::generate();

        store.add_archive("alice", key).await.unwrap();
        store.add_archive("bob", key).await.unwrap();
        store.remove_archive("alice", key).await.unwrap();
        store.remove_archive("bob", key).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), RecordEvent::ArchiveAdded { .. }));
        assert!(matches!(events.recv().await.unwrap(), RecordEvent::ArchiveAdded { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            RecordEvent::ArchiveRemoved { still_hosted: true, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RecordEvent::ArchiveRemoved { still_hosted: false, .. }
        ));
    }

    #[tokio::test]
    async fn listed_archives_are_distinct() {
        let store = RecordStore::in_memory();
        let a = ArchiveKey::from_bytes([1; 32]);
        let b = ArchiveKey::from_bytes([2; 32]);
        store.add_archive("alice", b).await.unwrap();
        store.add_archive("alice", a).await.unwrap();
        store.add_archive("bob", b).await.unwrap();

        let listed: Vec<ArchiveKey> = store.list().map(|r| r.unwrap().key).collect().await;
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn listener_follows_records() {
        let root = tempfile::tempdir().unwrap();
        let loader = ArchiveLoader::new(root.path(), Arc::new(InMemoryStorageBackend::new()));
        let registry = ArchiveRegistry::new(loader, SwarmReplicator::disabled());
        let mut lifecycle = registry.subscribe();

        let store = RecordStore::in_memory();
        let listener = spawn_record_listener(registry.clone(), &store);
        let key = ArchiveKey::generate();

        store.add_archive("alice", key).await.unwrap();
        assert!(matches!(lifecycle.recv().await.unwrap(), RegistryEvent::Loaded { .. }));
        assert!(registry.get_archive(&key).is_some());

        store.add_archive("bob", key).await.unwrap();
        store.remove_archive("alice", key).await.unwrap();
        store.remove_archive("bob", key).await.unwrap();
        assert_eq!(lifecycle.recv().await.unwrap(), RegistryEvent::Closed { key });
        assert!(registry.get_archive(&key).is_none());

        drop(store);
        listener.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn add_then_remove_never_leaves_archive_resident() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());
        let store = RecordStore::in_memory();
        let listener = spawn_record_listener(registry.clone(), &store);

        for _ in 0..200 {
            let key = ArchiveKey::generate();
            store.add_archive("alice", key).await.unwrap();
            store.remove_archive("alice", key).await.unwrap();
        }

        drop(store);
        listener.await.unwrap();
        assert_eq!(registry.resident_count(), 0);
        assert!(registry.resident_keys().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remove_racing_another_owners_add_keeps_archive() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path());
        let backend = Arc::new(GatedBackend::default());
        let store = Arc::new(RecordStore::new(backend.clone()));
        let listener = spawn_record_listener(registry.clone(), &store);
        let mut lifecycle = registry.subscribe();
        let key = ArchiveKey::generate();

        store.add_archive("alice", key).await.unwrap();
        assert!(matches!(lifecycle.recv().await.unwrap(), RegistryEvent::Loaded { .. }));

        // Hold alice's removal between writing her record and checking
        // whether anyone else still hosts the archive.
        let (entered, release) = backend.arm();
        let remove = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.remove_archive("alice", key).await }
        });
        entered.wait().await;
        let add = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.add_archive("bob", key).await }
        });
        tokio::task::yield_now().await;
        release.set(()).unwrap();

        assert!(remove.await.unwrap().unwrap());
        assert!(add.await.unwrap().unwrap());
        assert!(store.is_hosted(&key).await.unwrap());

        drop(store);
        listener.await.unwrap();
        assert!(registry.get_archive(&key).is_some());
    }
}
