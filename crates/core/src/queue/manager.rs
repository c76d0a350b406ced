//! Bounded two-stage update queue.
//!
//! Updates enter the *pre* stage, where a cheap change check decides whether
//! they are worth processing, and are promoted to the *main* stage for the
//! expensive work. Both stages share one capacity; when it is reached the
//! item furthest from the center is evicted to make room.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::overload::{LogOverloadSink, OverloadEvent, OverloadNotifier, OverloadSink};
use super::position::PositionQueue;
use super::work_key::{QueuedItem, WorkKey};
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// How many updates may be queued per worker thread and consumer.
pub const DEFAULT_MAX_QUEUED_PER_THREAD_PER_CONSUMER: usize = 1_000;

/// Which stage gives up an item when a pre-stage insert finds the queues full.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Evict from main first; pre-stage items are the cheaper ones to
    /// recompute when they are requested again.
    #[default]
    MainFirst,
    PreFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// Inserted after evicting the given key.
    InsertedWithEviction(WorkKey),
    /// The key was already queued in that stage.
    Duplicate,
    /// The queues were full and the new item was the furthest candidate.
    Rejected,
}

impl AddOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted | Self::InsertedWithEviction(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pre,
    Main,
}

pub struct UpdateQueueManager<P, T: TimeSource = InstantTimeSrc> {
    pre: PositionQueue<P>,
    main: PositionQueue<P>,
    max_size: AtomicUsize,
    per_thread_budget: AtomicUsize,
    policy: EvictionPolicy,
    /// Serializes the check-evict-insert sequence so the capacity bound holds
    /// under concurrent producers. Pops never take it.
    insert_lock: Mutex<()>,
    notifier: OverloadNotifier<T>,
}

impl<P> UpdateQueueManager<P, InstantTimeSrc> {
    pub fn new(max_size: usize) -> Self {
        Self::with_notifier(
            max_size,
            EvictionPolicy::default(),
            OverloadNotifier::new(
                super::overload::DEFAULT_OVERLOAD_COOLDOWN,
                Arc::new(LogOverloadSink),
            ),
        )
    }

    pub fn with_sink(max_size: usize, sink: Arc<dyn OverloadSink>) -> Self {
        Self::with_notifier(
            max_size,
            EvictionPolicy::default(),
            OverloadNotifier::new(super::overload::DEFAULT_OVERLOAD_COOLDOWN, sink),
        )
    }
}

impl<P, T: TimeSource> UpdateQueueManager<P, T> {
    pub fn with_notifier(max_size: usize, policy: EvictionPolicy, notifier: OverloadNotifier<T>) -> Self {
        Self {
            pre: PositionQueue::new(),
            main: PositionQueue::new(),
            max_size: AtomicUsize::new(max_size.max(1)),
            per_thread_budget: AtomicUsize::new(DEFAULT_MAX_QUEUED_PER_THREAD_PER_CONSUMER),
            policy,
            insert_lock: Mutex::new(()),
            notifier,
        }
    }

    /// Queues an update whose change check has not run yet.
    pub fn add_to_pre_stage(&self, item: QueuedItem<P>) -> AddOutcome {
        self.add(Stage::Pre, item)
    }

    /// Queues an update that must be processed.
    pub fn add_to_main_stage(&self, item: QueuedItem<P>) -> AddOutcome {
        self.add(Stage::Main, item)
    }

    fn add(&self, stage: Stage, item: QueuedItem<P>) -> AddOutcome {
        let key = item.key;
        let outcome = {
            let _guard = self.insert_lock.lock();
            let target = self.stage(stage);
            if target.contains(&key) {
                return AddOutcome::Duplicate;
            }

            let mut evicted = None;
            while self.len_unlocked() >= self.max_size() {
                let Some(victim_stage) = self.eviction_stage(stage) else {
                    break;
                };
                let victim = self.stage(victim_stage);
                let incoming_distance = key.squared_distance(&victim.center());
                if victim_stage == stage
                    && victim
                        .furthest_distance()
                        .is_some_and(|furthest| incoming_distance > furthest)
                {
                    tracing::trace!(%key, "Queues full and incoming update is the furthest, dropping it");
                    return AddOutcome::Rejected;
                }
                match victim.pop_furthest() {
                    Some(removed) => {
                        tracing::trace!(evicted = %removed.key, ?victim_stage, "Evicted queued update");
                        evicted = Some(removed.key);
                    }
                    None => break,
                }
            }

            target.add(item);
            match evicted {
                Some(evicted) => AddOutcome::InsertedWithEviction(evicted),
                None => AddOutcome::Inserted,
            }
        };

        let queued = self.queued_count();
        let max_size = self.max_size();
        if queued >= max_size {
            self.notifier.notify(OverloadEvent {
                queued,
                max_size,
                per_thread_budget: self.per_thread_budget.load(Ordering::Relaxed),
            });
        }
        outcome
    }

    /// Picks the stage to evict from for an insert into `inserting`.
    fn eviction_stage(&self, inserting: Stage) -> Option<Stage> {
        let candidates: &[Stage] = match (inserting, self.policy) {
            // main-stage inserts reach into pre only once main is empty
            (Stage::Main, _) => &[Stage::Main, Stage::Pre],
            (Stage::Pre, EvictionPolicy::MainFirst) => &[Stage::Main, Stage::Pre],
            (Stage::Pre, EvictionPolicy::PreFirst) => &[Stage::Pre, Stage::Main],
        };
        candidates
            .iter()
            .copied()
            .find(|stage| !self.stage(*stage).is_empty())
    }

    fn stage(&self, stage: Stage) -> &PositionQueue<P> {
        match stage {
            Stage::Pre => &self.pre,
            Stage::Main => &self.main,
        }
    }

    pub fn pop_closest_pre(&self) -> Option<QueuedItem<P>> {
        self.pre.pop_closest()
    }

    pub fn pop_closest_main(&self) -> Option<QueuedItem<P>> {
        self.main.pop_closest()
    }

    /// Whether the key is queued in either stage.
    pub fn contains(&self, key: &WorkKey) -> bool {
        self.main.contains(key) || self.pre.contains(key)
    }

    pub fn set_center(&self, center: WorkKey) {
        self.main.set_center(center);
        self.pre.set_center(center);
    }

    pub fn center(&self) -> WorkKey {
        self.main.center()
    }

    /// Drops every queued update; work already popped still runs.
    pub fn clear(&self) {
        let _guard = self.insert_lock.lock();
        self.main.clear();
        self.pre.clear();
    }

    pub fn pre_count(&self) -> usize {
        self.pre.len()
    }

    pub fn main_count(&self) -> usize {
        self.main.len()
    }

    /// Total queued in both stages.
    ///
    /// Read under the insert lock so a concurrent promotion between stages
    /// cannot be counted twice.
    pub fn queued_count(&self) -> usize {
        let _guard = self.insert_lock.lock();
        self.len_unlocked()
    }

    fn len_unlocked(&self) -> usize {
        self.pre.len() + self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.pre.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Sets the capacity, clamped to at least one.
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size.max(1), Ordering::Release);
    }

    /// Derives the capacity as `threads * per_thread_budget * consumers`.
    pub fn recompute_max_size(&self, threads: usize, per_thread_budget: usize, consumers: usize) -> usize {
        self.per_thread_budget
            .store(per_thread_budget, Ordering::Relaxed);
        let max_size = threads
            .saturating_mul(per_thread_budget)
            .saturating_mul(consumers)
            .max(1);
        self.set_max_size(max_size);
        max_size
    }

    pub fn status(&self) -> QueueStatus {
        let _guard = self.insert_lock.lock();
        let pre = self.pre_count();
        let main = self.main_count();
        QueueStatus {
            pre,
            main,
            total: pre + main,
            max: self.max_size(),
        }
    }
}

/// Snapshot of the queue counters for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pre: usize,
    pub main: usize,
    pub total: usize,
    pub max: usize,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queued chunk updates: ( {} + {} )  [ {} / {} ]",
            self.pre, self.main, self.total, self.max
        )
    }
}
