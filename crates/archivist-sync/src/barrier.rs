use std::sync::Arc;

use tokio::sync::watch;

use crate::error::BarrierError;

/// A value that starts unset, is set exactly once, and can be awaited by any
/// number of tasks.
///
/// Clones share the same slot: setting through one clone wakes waiters on
/// every other clone.
pub struct CompletionBarrier<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> CompletionBarrier<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Set the value and wake all waiters.
    ///
    /// Only the first call succeeds; later calls leave the stored value
    /// untouched and return [`BarrierError::AlreadySet`].
    pub fn set(&self, value: T) -> Result<(), BarrierError> {
        let mut value = Some(value);
        let stored = self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        });
        if stored {
            Ok(())
        } else {
            Err(BarrierError::AlreadySet)
        }
    }

    /// Suspend until the value is set, then return a clone of it.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .expect("barrier sender outlives its waiters");
        slot.clone().expect("wait_for only returns once the slot is set")
    }

    /// The value, if already set. Never suspends.
    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

impl<T> Clone for CompletionBarrier<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for CompletionBarrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for CompletionBarrier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBarrier")
            .field("value", &self.get())
            .finish()
    }
}
