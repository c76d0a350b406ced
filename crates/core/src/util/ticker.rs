//! Fixed-rate background ticking over an explicit registry.
//!
//! Components that need periodic maintenance (payload senders, save caches,
//! reassembly buffers) register with a [`PeriodicTicker`] and receive a
//! [`TickHandle`]. Dropping the handle unregisters the component; a single
//! background task drives every registered entry at the ticker's period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// A component driven by a [`PeriodicTicker`].
///
/// Ticks may block (sinks writing to a socket, save handlers doing I/O); the
/// spawned ticker runs each pass on tokio's blocking pool.
pub trait Tick: Send + Sync {
    fn tick(&self);
}

type Registry = DashMap<u64, Arc<dyn Tick>>;

pub struct PeriodicTicker {
    name: &'static str,
    period: Duration,
    entries: Arc<Registry>,
    next_id: AtomicU64,
}

impl PeriodicTicker {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn register(&self, entry: Arc<dyn Tick>) -> TickHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, entry);
        tracing::trace!(ticker = self.name, id, "Registered periodic entry");
        TickHandle {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub fn registered(&self) -> usize {
        self.entries.len()
    }

    /// Ticks every registered entry once on the calling thread.
    pub fn tick_all(&self) {
        tick_registry(&self.entries);
    }

    /// Spawns the background task on the current tokio runtime.
    ///
    /// Each pass runs through [`tokio::task::spawn_blocking`] and is awaited
    /// before the next one, so passes never overlap. A pass longer than the
    /// period delays the following ticks. The task ends once the ticker
    /// itself is dropped.
    pub fn spawn(&self) -> JoinHandle<()> {
        let entries = Arc::downgrade(&self.entries);
        let period = self.period;
        let name = self.name;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(entries) = entries.upgrade() else {
                    tracing::debug!(ticker = name, "Ticker dropped, stopping");
                    break;
                };
                let pass = tokio::task::spawn_blocking(move || tick_registry(&entries));
                if let Err(error) = pass.await {
                    tracing::error!(ticker = name, %error, "Tick pass failed");
                }
            }
        })
    }
}

fn tick_registry(entries: &Registry) {
    // snapshot so entries may unregister themselves while ticking
    let snapshot: Vec<Arc<dyn Tick>> = entries.iter().map(|e| Arc::clone(e.value())).collect();
    for entry in snapshot {
        entry.tick();
    }
}

/// Keeps an entry registered; unregisters on drop.
pub struct TickHandle {
    id: u64,
    entries: Weak<Registry>,
}

impl TickHandle {
    pub fn unregister(self) {}
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.remove(&self.id);
        }
    }
}
