//! Receiver-side AIMD rate estimation.
//!
//! The receiver counts the bytes delivered during each interval. At the
//! interval boundary the desired rate grows by a fixed step when delivery
//! kept up with it, and otherwise falls back to just below what was actually
//! delivered. The sender learns the rate through whatever channel carries
//! the rate-changed notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::util::ticker::Tick;
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Growth per interval in bytes/sec when delivery keeps up.
pub const ADDITIVE_INCREASE: f64 = 50_000.0;
/// Measurement interval.
pub const INTERVAL: Duration = Duration::from_millis(1000);
/// Lowest rate the controller will ever ask for, in bytes/sec.
pub const RATE_FLOOR: f64 = 1_000.0;

#[derive(Debug, Clone)]
pub struct AimdConfig {
    pub additive_increase: f64,
    pub interval: Duration,
    pub floor: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            additive_increase: ADDITIVE_INCREASE,
            interval: INTERVAL,
            floor: RATE_FLOOR,
        }
    }
}

impl AimdConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }
}

type RateCallback = Box<dyn Fn(u32) + Send + Sync>;

struct RateState {
    desired_rate: f64,
    last_adjust: Instant,
}

pub struct AimdController<T: TimeSource = InstantTimeSrc> {
    config: AimdConfig,
    state: Mutex<RateState>,
    /// Bytes delivered since the last adjustment.
    received: AtomicU64,
    on_rate_changed: Option<RateCallback>,
    time_source: T,
}

impl AimdController<InstantTimeSrc> {
    pub fn new(config: AimdConfig) -> Self {
        Self::new_with_time_source(config, InstantTimeSrc::new())
    }
}

impl<T: TimeSource> AimdController<T> {
    pub fn new_with_time_source(config: AimdConfig, time_source: T) -> Self {
        let now = time_source.now();
        Self {
            state: Mutex::new(RateState {
                desired_rate: config.additive_increase,
                last_adjust: now,
            }),
            config,
            received: AtomicU64::new(0),
            on_rate_changed: None,
            time_source,
        }
    }

    /// Registers the callback invoked with the new rate in KB/s after every
    /// adjustment.
    pub fn on_rate_changed(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_rate_changed = Some(Box::new(callback));
        self
    }

    /// Records a delivered payload.
    ///
    /// Closes the current interval first if it has elapsed, so the bytes
    /// count toward the interval they arrived in.
    pub fn on_payload_received(&self, bytes: usize) {
        self.poll();
        self.received.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Adjusts the rate if the interval has elapsed.
    ///
    /// Returns the new rate in bytes/sec when an adjustment happened.
    pub fn poll(&self) -> Option<f64> {
        let now = self.time_source.now();
        let new_rate = {
            let mut state = self.state.lock();
            if now.saturating_duration_since(state.last_adjust) < self.config.interval {
                return None;
            }
            let throughput = self.received.swap(0, Ordering::AcqRel) as f64;
            if throughput >= state.desired_rate {
                state.desired_rate += self.config.additive_increase;
            } else {
                state.desired_rate =
                    (throughput - self.config.additive_increase / 2.0).max(self.config.floor);
            }
            state.last_adjust = now;
            tracing::trace!(
                throughput,
                desired_rate = state.desired_rate,
                "Adjusted desired rate"
            );
            state.desired_rate
        };
        if let Some(callback) = &self.on_rate_changed {
            callback(to_kbps(new_rate));
        }
        Some(new_rate)
    }

    /// Back to a single increase step, for a new or re-established
    /// connection.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.desired_rate = self.config.additive_increase;
        state.last_adjust = self.time_source.now();
        self.received.store(0, Ordering::Release);
    }

    /// Desired rate in bytes/sec.
    pub fn desired_rate(&self) -> f64 {
        self.state.lock().desired_rate
    }

    /// Desired rate in KB/s, the unit senders are configured in.
    pub fn desired_rate_kbps(&self) -> u32 {
        to_kbps(self.desired_rate())
    }
}

impl<T: TimeSource> Tick for AimdController<T> {
    fn tick(&self) {
        self.poll();
    }
}

fn to_kbps(rate: f64) -> u32 {
    (rate / 1000.0) as u32
}
