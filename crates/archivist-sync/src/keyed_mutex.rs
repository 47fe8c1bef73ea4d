use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap<K> = StdMutex<HashMap<K, Arc<Mutex<()>>>>;

/// Per-key async mutual exclusion.
///
/// - Holders of the same key never overlap: a second `acquire` suspends
///   until the current guard is released.
/// - Waiters on one key are granted the lock in arrival order.
/// - Different keys never block each other.
///
/// A key's entry lives only while someone holds or waits on it, so the map
/// does not accumulate keys that were locked once. Cloning a `KeyedMutex`
/// shares the same set of locks.
pub struct KeyedMutex<K> {
    locks: Arc<LockMap<K>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, suspending while another guard for the
    /// same key is alive.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue without ever holding the lock.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut map = self.locks.lock().expect("keyed mutex lock poisoned");
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let mut reclaim = Reclaim {
            locks: &self.locks,
            key: &key,
            armed: true,
        };
        let guard = lock.lock_owned().await;
        reclaim.armed = false;

        KeyedGuard {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys that currently have a holder or a waiter.
    pub fn held_keys(&self) -> usize {
        self.locks.lock().expect("keyed mutex lock poisoned").len()
    }
}

impl<K> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("held_keys", &self.held_keys())
            .finish()
    }
}

/// Proof of holding one key of a [`KeyedMutex`]. Releases on drop.
pub struct KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap<K>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the lock now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // Hand the lock to the next waiter before checking whether the entry
        // is still referenced.
        self.guard.take();
        reclaim(&self.locks, &self.key);
    }
}

/// Cleans up the entry if an `acquire` future is dropped while queued.
struct Reclaim<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a LockMap<K>,
    key: &'a K,
    armed: bool,
}

impl<K> Drop for Reclaim<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.armed {
            reclaim(self.locks, self.key);
        }
    }
}

/// Remove the entry for `key` once only the map itself references it.
///
/// New holders clone the `Arc` under the same map lock, so a count of one
/// here means nobody holds or waits on the key.
fn reclaim<K>(locks: &LockMap<K>, key: &K)
where
    K: Eq + Hash + Clone,
{
    let mut map = locks.lock().expect("keyed mutex lock poisoned");
    if let Some(lock) = map.get(key) {
        if Arc::strong_count(lock) == 1 {
            map.remove(key);
            trace!("keyed mutex entry reclaimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_sections_never_overlap() {
        let mutex = KeyedMutex::new();
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            tasks.push(tokio::spawn(async move {
                let _guard = mutex.acquire("record").await;
                assert!(!inside.swap(true, Ordering::SeqCst), "critical sections overlapped");
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.store(false, Ordering::SeqCst);
                entered.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() {
        let mutex = KeyedMutex::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let holder = mutex.acquire(1u32).await;
        let mut tasks = Vec::new();
        for i in 0..5 {
            let mutex = mutex.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard = mutex.acquire(1u32).await;
                order.lock().unwrap().push(i);
            }));
            // Let the task reach the queue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        holder.release();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let mutex = KeyedMutex::new();
        let _a = mutex.acquire("a".to_string()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), mutex.acquire("b".to_string()))
            .await
            .expect("acquiring another key must not wait");
        assert_eq!(b.key(), "b");
        assert_eq!(mutex.held_keys(), 2);
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let mutex = KeyedMutex::new();
        let first = mutex.acquire("k").await;
        let blocked = tokio::time::timeout(Duration::from_millis(30), mutex.acquire("k")).await;
        assert!(blocked.is_err());
        drop(first);
        tokio::time::timeout(Duration::from_millis(100), mutex.acquire("k"))
            .await
            .expect("lock should be free after release");
    }

    #[tokio::test]
    async fn entries_are_reclaimed_after_release() {
        let mutex = KeyedMutex::new();
        {
            let _g = mutex.acquire("k").await;
            assert_eq!(mutex.held_keys(), 1);
        }
        assert_eq!(mutex.held_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_reclaims_entry() {
        let mutex = KeyedMutex::new();
        let holder = mutex.acquire("k").await;
        let res = tokio::time::timeout(Duration::from_millis(20), mutex.acquire("k")).await;
        assert!(res.is_err());
        holder.release();
        assert_eq!(mutex.held_keys(), 0);
    }
}
