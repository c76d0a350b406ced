use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Minimum time between two overload advisories.
pub const DEFAULT_OVERLOAD_COOLDOWN: Duration = Duration::from_secs(30);

/// Emitted when the update queues reach their capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverloadEvent {
    pub queued: usize,
    pub max_size: usize,
    pub per_thread_budget: usize,
}

impl fmt::Display for OverloadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk update pipeline overloaded, too many updates queued for processing. \
             This may leave holes in the processed data. \
             Fix: move through the world slower, reduce the load being generated, \
             or increase the worker thread count. \
             Max queue count [{}] ([{}] per thread+consumer), currently queued [{}].",
            self.max_size, self.per_thread_budget, self.queued
        )
    }
}

/// Receives overload advisories.
pub trait OverloadSink: Send + Sync {
    fn on_overload(&self, event: &OverloadEvent);
}

/// Default sink: logs the advisory.
pub struct LogOverloadSink;

impl OverloadSink for LogOverloadSink {
    fn on_overload(&self, event: &OverloadEvent) {
        tracing::warn!(
            queued = event.queued,
            max_size = event.max_size,
            "{event}"
        );
    }
}

/// Rate limits overload advisories to one per cooldown window.
pub struct OverloadNotifier<T: TimeSource = InstantTimeSrc> {
    cooldown: Duration,
    last_notified: Mutex<Option<Instant>>,
    sink: Arc<dyn OverloadSink>,
    time_source: T,
}

impl OverloadNotifier<InstantTimeSrc> {
    pub fn new(cooldown: Duration, sink: Arc<dyn OverloadSink>) -> Self {
        Self::with_time_source(cooldown, sink, InstantTimeSrc::new())
    }
}

impl<T: TimeSource> OverloadNotifier<T> {
    pub fn with_time_source(cooldown: Duration, sink: Arc<dyn OverloadSink>, time_source: T) -> Self {
        Self {
            cooldown,
            last_notified: Mutex::new(None),
            sink,
            time_source,
        }
    }

    /// Forwards the event unless one was forwarded within the cooldown.
    ///
    /// Returns whether the event reached the sink.
    pub fn notify(&self, event: OverloadEvent) -> bool {
        let now = self.time_source.now();
        {
            let mut last = self.last_notified.lock();
            if let Some(last) = *last {
                if now.saturating_duration_since(last) < self.cooldown {
                    return false;
                }
            }
            *last = Some(now);
        }
        self.sink.on_overload(&event);
        true
    }
}
