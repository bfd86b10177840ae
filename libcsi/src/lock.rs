//! Volume Lock Registry: per-key mutual exclusion.
//!
//! Calls with the same key (a volume id, a volume name, a node id) run one
//! at a time; calls with different keys never wait on each other.  Entries
//! exist only while someone holds or waits for them, so the map does not
//! grow with the number of volumes ever seen.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// The mutex payload records when the current holder acquired it.
type Slot = Arc<Mutex<Option<Instant>>>;

/// Process-local registry of keyed locks.  Never persisted.
#[derive(Debug)]
pub struct LockRegistry<K>
where
    K: Eq + Hash,
{
    slots: DashMap<K, Slot>,
}

impl<K> Default for LockRegistry<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K> LockRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `key`.  It is released when the guard drops,
    /// which also happens when the owning future is cancelled.
    pub async fn acquire(&self, key: &K) -> KeyGuard<'_, K> {
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let mut guard = match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(%key, "waiting for in-flight operation on the same key");
                slot.lock_owned().await
            }
        };
        *guard = Some(Instant::now());
        KeyGuard {
            registry: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Run `f` while holding the lock on `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Holds the lock on one key.
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone + Display,
{
    registry: &'a LockRegistry<K>,
    key: K,
    guard: Option<OwnedMutexGuard<Option<Instant>>>,
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if let Some(since) = guard.take() {
                debug!(key = %self.key, held_for = ?since.elapsed(), "lock released");
            }
        }
        // Only the map still references an idle slot.
        self.registry
            .slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let registry = Arc::new(LockRegistry::<String>::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                registry
                    .with_lock(&"vol-1".to_owned(), || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let registry = LockRegistry::<String>::new();
        let _a = registry.acquire(&"a".to_owned()).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            registry.acquire(&"b".to_owned()),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn released_on_error_path() {
        let registry = LockRegistry::<String>::new();
        let key = "vol-err".to_owned();
        let out: Result<(), &str> = registry.with_lock(&key, || async { Err("boom") }).await;
        assert!(out.is_err());
        assert!(registry.is_empty());
        // Reacquiring must not hang.
        let again = tokio::time::timeout(Duration::from_millis(100), registry.acquire(&key)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn released_when_waiter_is_cancelled() {
        let registry = Arc::new(LockRegistry::<String>::new());
        let key = "vol-cancel".to_owned();

        let holder = registry.acquire(&key).await;
        let waiting = tokio::time::timeout(Duration::from_millis(20), registry.acquire(&key)).await;
        assert!(waiting.is_err());
        drop(holder);

        assert!(registry.is_empty());
        let again = tokio::time::timeout(Duration::from_millis(100), registry.acquire(&key)).await;
        assert!(again.is_ok());
    }
}
