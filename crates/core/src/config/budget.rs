use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Listener = Arc<dyn Fn(usize) + Send + Sync>;

/// The runtime-adjustable worker thread count shared by every executor.
///
/// Listeners are notified after the value changes, outside any internal
/// lock, so they may read the budget back.
pub struct ThreadBudget {
    threads: AtomicUsize,
    listeners: Mutex<Vec<Listener>>,
}

impl ThreadBudget {
    /// Creates a budget of at least one thread.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: AtomicUsize::new(threads.max(1)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    /// Updates the thread count, returning whether it changed.
    pub fn set(&self, threads: usize) -> bool {
        let threads = threads.max(1);
        let previous = self.threads.swap(threads, Ordering::AcqRel);
        if previous == threads {
            return false;
        }
        tracing::info!(previous, threads, "Worker thread budget changed");
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(threads);
        }
        true
    }

    pub fn subscribe(&self, listener: impl Fn(usize) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }
}

impl std::fmt::Debug for ThreadBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBudget")
            .field("threads", &self.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_only_fire_on_change() {
        let budget = ThreadBudget::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        budget.subscribe(move |threads| seen_cb.lock().push(threads));

        assert!(!budget.set(4));
        assert!(budget.set(2));
        assert!(budget.set(0));
        assert_eq!(budget.get(), 1);
        assert_eq!(*seen.lock(), vec![2, 1]);
    }
}
