use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use archivist_sync::CompletionBarrier;
use archivist_types::ArchiveKey;
use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::traits::{ArchiveStorage, StorageBackend};

/// Lifecycle step a fault can be injected into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoragePhase {
    Open,
    Ready,
    Close,
}

impl StoragePhase {
    fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ready => "ready",
            Self::Close => "close",
        }
    }
}

#[derive(Default)]
struct Shared {
    opens: RwLock<HashMap<ArchiveKey, usize>>,
    closes: RwLock<HashMap<ArchiveKey, usize>>,
    faults: RwLock<HashMap<ArchiveKey, HashSet<StoragePhase>>>,
    ready_gate: RwLock<Option<CompletionBarrier<()>>>,
}

impl Shared {
    fn check(&self, key: &ArchiveKey, phase: StoragePhase) -> StoreResult<()> {
        let faults = self.faults.read().expect("lock poisoned");
        if faults.get(key).is_some_and(|set| set.contains(&phase)) {
            return Err(StoreError::Injected {
                key: *key,
                phase: phase.name(),
            });
        }
        Ok(())
    }
}

/// Storage backend that keeps nothing on disk.
///
/// Intended for tests and embedding. It records how often each key was
/// opened and closed, can fail any lifecycle step for a chosen key, and can
/// hold every `ready` call behind a gate so callers can observe a load while
/// it is still pending. Clones share counters, faults, and the gate.
#[derive(Clone, Default)]
pub struct InMemoryStorageBackend {
    shared: Arc<Shared>,
}

impl InMemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open` calls made for `key`, including failed ones.
    pub fn open_count(&self, key: &ArchiveKey) -> usize {
        let opens = self.shared.opens.read().expect("lock poisoned");
        opens.get(key).copied().unwrap_or(0)
    }

    /// Number of successful `close` calls made for `key`.
    pub fn close_count(&self, key: &ArchiveKey) -> usize {
        let closes = self.shared.closes.read().expect("lock poisoned");
        closes.get(key).copied().unwrap_or(0)
    }

    /// Make `phase` fail for `key` until [`Self::clear_faults`] is called.
    pub fn fail(&self, key: &ArchiveKey, phase: StoragePhase) {
        let mut faults = self.shared.faults.write().expect("lock poisoned");
        faults.entry(*key).or_default().insert(phase);
    }

    pub fn clear_faults(&self, key: &ArchiveKey) {
        self.shared.faults.write().expect("lock poisoned").remove(key);
    }

    /// Hold every subsequent `ready` call until the returned barrier is set.
    pub fn hold_ready(&self) -> CompletionBarrier<()> {
        let gate = CompletionBarrier::new();
        *self.shared.ready_gate.write().expect("lock poisoned") = Some(gate.clone());
        gate
    }
}

impl std::fmt::Debug for InMemoryStorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let opens: usize = self.shared.opens.read().expect("lock poisoned").values().sum();
        f.debug_struct("InMemoryStorageBackend")
            .field("total_opens", &opens)
            .finish()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorageBackend {
    async fn open(&self, key: &ArchiveKey, _dir: &Path) -> StoreResult<Box<dyn ArchiveStorage>> {
        *self
            .shared
            .opens
            .write()
            .expect("lock poisoned")
            .entry(*key)
            .or_default() += 1;
        self.shared.check(key, StoragePhase::Open)?;

        let gate = self.shared.ready_gate.read().expect("lock poisoned").clone();
        Ok(Box::new(InMemoryStorage {
            key: *key,
            shared: Arc::clone(&self.shared),
            gate,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Storage handle produced by [`InMemoryStorageBackend`].
pub struct InMemoryStorage {
    key: ArchiveKey,
    shared: Arc<Shared>,
    gate: Option<CompletionBarrier<()>>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ArchiveStorage for InMemoryStorage {
    fn key(&self) -> &ArchiveKey {
        &self.key
    }

    async fn ready(&self) -> StoreResult<()> {
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        self.shared.check(&self.key, StoragePhase::Ready)
    }

    async fn close(&self) -> StoreResult<()> {
        self.shared.check(&self.key, StoragePhase::Close)?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            *self
                .shared
                .closes
                .write()
                .expect("lock poisoned")
                .entry(self.key)
                .or_default() += 1;
        }
        Ok(())
    }
}
