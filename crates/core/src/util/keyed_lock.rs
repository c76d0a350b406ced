//! Per-key mutual exclusion.
//!
//! Threads locking the same key serialize while threads locking different
//! keys proceed in parallel. Lock entries are created on demand and removed
//! by [`KeyedLocks::prune`] once nobody holds or waits on them.

use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
    outstanding: Arc<AtomicUsize>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks until the lock for `key` is acquired.
    ///
    /// The map shard is only held while cloning the lock handle, never while
    /// waiting on the key itself.
    pub fn lock(&self, key: &K) -> KeyGuard {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_arc();
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        KeyGuard {
            _guard: guard,
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    /// Drops lock entries no thread currently references.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of guards currently alive.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Releases the key on drop.
pub struct KeyGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let counter = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _guard = locks.lock(&7);
                    counter.lock().push((i, "enter"));
                    thread::sleep(Duration::from_millis(5));
                    counter.lock().push((i, "exit"));
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }

        // every enter must be immediately followed by the matching exit
        let events = counter.lock();
        for pair in events.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(&1);
        let _b = locks.lock(&2);
        assert_eq!(locks.outstanding(), 2);
    }

    #[test]
    fn test_prune_removes_unused_entries() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _a = locks.lock(&1);
        }
        let held = locks.lock(&2);

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.outstanding(), 0);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
