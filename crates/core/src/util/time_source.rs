use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// A simple time source that returns the current time using `Instant::now()`.
#[derive(Clone, Copy, Default)]
pub struct InstantTimeSrc(());

impl InstantTimeSrc {
    pub fn new() -> Self {
        InstantTimeSrc(())
    }
}

impl TimeSource for InstantTimeSrc {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually driven clock.
///
/// Clones share the same underlying instant, so a component can own one
/// clone while the test advances another.
#[derive(Clone)]
pub struct SharedMockTimeSource {
    current_instant: Arc<Mutex<Instant>>,
}

impl Default for SharedMockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMockTimeSource {
    pub fn new() -> Self {
        Self::with_instant(Instant::now())
    }

    pub fn with_instant(start_instant: Instant) -> Self {
        SharedMockTimeSource {
            current_instant: Arc::new(Mutex::new(start_instant)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.current_instant.lock() += duration;
    }
}

impl TimeSource for SharedMockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}
