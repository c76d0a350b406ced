//! Write-behind cache batching updates to the same key.
//!
//! Incoming updates are merged into an in-memory accumulator per key and
//! only handed to the [`SaveHandler`] once the key has been idle for the save
//! delay, so a burst of edits to one position results in a single save.
//!
//! Caches are driven by a [`PeriodicTicker`](crate::util::PeriodicTicker)
//! running at [`CLEANUP_CHECK_INTERVAL`]; dropping the registration handle
//! stops the background cleanup for that cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::queue::WorkKey;
use crate::util::keyed_lock::KeyedLocks;
use crate::util::ticker::Tick;
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// How often registered caches look for idle entries.
pub const CLEANUP_CHECK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Data that can absorb later partial updates for the same key.
pub trait Mergeable: Send + Sync + 'static {
    /// An accumulator holding nothing yet.
    fn empty(key: WorkKey) -> Self;

    fn merge_from(&mut self, update: &Self);
}

/// Persists an accumulator once it leaves the cache.
pub trait SaveHandler<D>: Send + Sync {
    fn save(&self, key: WorkKey, data: D);
}

impl<D, F> SaveHandler<D> for F
where
    F: Fn(WorkKey, D) + Send + Sync,
{
    fn save(&self, key: WorkKey, data: D) {
        self(key, data)
    }
}

struct PendingSave<D> {
    data: D,
    last_written: Instant,
}

pub struct DelayedSaveCache<D, H, T: TimeSource = InstantTimeSrc> {
    entries: DashMap<WorkKey, PendingSave<D>>,
    locks: KeyedLocks<WorkKey>,
    handler: H,
    save_delay: Duration,
    time_source: T,
}

impl<D: Mergeable, H: SaveHandler<D>> DelayedSaveCache<D, H, InstantTimeSrc> {
    pub fn new(handler: H, save_delay: Duration) -> Self {
        Self::new_with_time_source(handler, save_delay, InstantTimeSrc::new())
    }
}

impl<D: Mergeable, H: SaveHandler<D>, T: TimeSource> DelayedSaveCache<D, H, T> {
    pub fn new_with_time_source(handler: H, save_delay: Duration, time_source: T) -> Self {
        if save_delay < CLEANUP_CHECK_INTERVAL {
            tracing::warn!(
                ?save_delay,
                cleanup_interval = ?CLEANUP_CHECK_INTERVAL,
                "Save delay shouldn't be less than the cleanup check interval"
            );
        }
        Self {
            entries: DashMap::new(),
            locks: KeyedLocks::new(),
            handler,
            save_delay,
            time_source,
        }
    }

    /// Merges `update` into the accumulator for `key` and restarts its save
    /// delay. The update is fully copied in before this returns.
    pub fn write(&self, key: WorkKey, update: &D) {
        let _key_lock = self.locks.lock(&key);
        let now = self.time_source.now();
        let mut pending = self.entries.entry(key).or_insert_with(|| PendingSave {
            data: D::empty(key),
            last_written: now,
        });
        pending.data.merge_from(update);
        pending.last_written = now;
    }

    /// Saves entries idle for longer than the save delay, or every entry
    /// when `flush_all` is set. Returns how many were saved.
    pub fn clean_up(&self, flush_all: bool) -> usize {
        let now = self.time_source.now();
        let keys: Vec<WorkKey> = self.entries.iter().map(|e| *e.key()).collect();

        let mut saved = 0;
        for key in keys {
            let removed = {
                let _key_lock = self.locks.lock(&key);
                self.entries.remove_if(&key, |_, pending| {
                    flush_all
                        || now.saturating_duration_since(pending.last_written) >= self.save_delay
                })
            };
            // the handler may do I/O, never call it under the key lock
            if let Some((key, pending)) = removed {
                tracing::trace!(%key, "Saving cached data");
                self.handler.save(key, pending.data);
                saved += 1;
            }
        }
        self.locks.prune();
        saved
    }

    pub fn flush(&self) -> usize {
        self.clean_up(true)
    }

    pub fn unsaved_count(&self) -> usize {
        self.entries.len()
    }

    pub fn save_delay(&self) -> Duration {
        self.save_delay
    }
}

impl<D: Mergeable, H: SaveHandler<D>, T: TimeSource> Tick for DelayedSaveCache<D, H, T> {
    fn tick(&self) {
        self.clean_up(false);
    }
}
