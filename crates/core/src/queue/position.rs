//! Distance-ordered, deduplicated work queue.
//!
//! Items are keyed by [`WorkKey`] and ordered by squared distance to a
//! movable center. Both ends of the ordering are available in `O(log n)`, so
//! the closest item can be served while the furthest one is evicted under
//! pressure.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use super::work_key::{QueuedItem, WorkKey};

/// Ordering entry: distance first, key as tie-break.
///
/// Ascending iteration yields closest-first, descending yields
/// furthest-first, and both ends agree on how equidistant keys are ordered.
type Slot = (u64, WorkKey);

pub struct PositionQueue<P> {
    inner: Mutex<Inner<P>>,
}

struct Inner<P> {
    center: WorkKey,
    order: BTreeSet<Slot>,
    items: HashMap<WorkKey, QueuedItem<P>>,
}

impl<P> Default for PositionQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PositionQueue<P> {
    /// Creates an empty queue centered on the origin; the real center arrives
    /// with the first [`PositionQueue::set_center`].
    pub fn new() -> Self {
        Self::with_center(WorkKey::default())
    }

    pub fn with_center(center: WorkKey) -> Self {
        Self {
            inner: Mutex::new(Inner {
                center,
                order: BTreeSet::new(),
                items: HashMap::new(),
            }),
        }
    }

    /// Inserts the item unless its key is already queued.
    ///
    /// Returns `false` when the key was present; the queued item is kept.
    pub fn add(&self, item: QueuedItem<P>) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.contains_key(&item.key) {
            return false;
        }
        let key = item.key;
        let distance = key.squared_distance(&inner.center);
        inner.order.insert((distance, key));
        inner.items.insert(key, item);
        true
    }

    pub fn pop_closest(&self) -> Option<QueuedItem<P>> {
        let mut inner = self.inner.lock();
        let (_, key) = inner.order.pop_first()?;
        inner.items.remove(&key)
    }

    pub fn pop_furthest(&self) -> Option<QueuedItem<P>> {
        let mut inner = self.inner.lock();
        let (_, key) = inner.order.pop_last()?;
        inner.items.remove(&key)
    }

    /// Distance from the center to the furthest queued key.
    pub fn furthest_distance(&self) -> Option<u64> {
        self.inner.lock().order.last().map(|(distance, _)| *distance)
    }

    /// Moves the center and reorders every queued key around it.
    ///
    /// No-op when the center is unchanged.
    pub fn set_center(&self, center: WorkKey) {
        let mut inner = self.inner.lock();
        if inner.center == center {
            return;
        }
        inner.center = center;
        inner.order = inner
            .items
            .keys()
            .map(|key| (key.squared_distance(&center), *key))
            .collect();
    }

    pub fn center(&self) -> WorkKey {
        self.inner.lock().center
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.inner.lock().items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.items.clear();
    }
}
