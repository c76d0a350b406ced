//! Paced, segmented payload sender.
//!
//! Payloads are queued whole and drained at a fixed tick rate. Each tick may
//! send as many bytes as the tightest of three limits allows: the configured
//! per-connection cap, the rate the receiving peer asked for, and this
//! sender's share of the global bandwidth. Any limit set to zero is ignored.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::bandwidth::{SenderBandwidthHandle, SharedBandwidthLimit};
use super::errors::TransferError;
use super::message::{SegmentMessage, TransferId};
use crate::util::ticker::Tick;

/// Largest segment, one mebibyte minus room for framing.
pub const DEFAULT_SEGMENT_SIZE: usize = 1_048_000;
pub const DEFAULT_TICK_RATE_HZ: u32 = 20;

/// Delivers segments to the receiving peer.
pub trait TransferSink: Send + Sync {
    fn send_segment(&self, segment: SegmentMessage) -> Result<(), TransferError>;
}

impl<F> TransferSink for F
where
    F: Fn(SegmentMessage) -> Result<(), TransferError> + Send + Sync,
{
    fn send_segment(&self, segment: SegmentMessage) -> Result<(), TransferError> {
        self(segment)
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub segment_size: usize,
    pub tick_rate_hz: u32,
    /// Per-connection cap in KB/s, `0` = unlimited.
    pub rate_limit_kbps: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            rate_limit_kbps: 0,
        }
    }
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

struct PendingTransfer {
    id: TransferId,
    payload: Bytes,
    /// Offset of the first unsent byte.
    cursor: usize,
    on_complete: Option<CompletionCallback>,
}

impl PendingTransfer {
    fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }
}

pub struct ChunkedTransferSender<S> {
    sink: S,
    config: SenderConfig,
    queue: Mutex<VecDeque<PendingTransfer>>,
    /// Rate reported by the peer's congestion controller, `0` until known.
    requested_kbps: AtomicU32,
    rate_limit_kbps: AtomicU64,
    bandwidth: SenderBandwidthHandle,
    tick_lock: Mutex<()>,
}

impl<S: TransferSink> ChunkedTransferSender<S> {
    pub fn new(sink: S, config: SenderConfig, bandwidth: Arc<SharedBandwidthLimit>) -> Self {
        Self {
            sink,
            rate_limit_kbps: AtomicU64::new(config.rate_limit_kbps),
            config: SenderConfig {
                segment_size: config.segment_size.max(1),
                tick_rate_hz: config.tick_rate_hz.max(1),
                ..config
            },
            queue: Mutex::new(VecDeque::new()),
            requested_kbps: AtomicU32::new(0),
            bandwidth: SenderBandwidthHandle::new(bandwidth),
            tick_lock: Mutex::new(()),
        }
    }

    /// Queues a payload. `on_complete` runs right after its last segment has
    /// been handed to the sink, typically to send the completion message.
    pub fn enqueue(
        &self,
        transfer_id: TransferId,
        payload: Bytes,
        on_complete: impl FnOnce() + Send + 'static,
    ) {
        self.queue.lock().push_back(PendingTransfer {
            id: transfer_id,
            payload,
            cursor: 0,
            on_complete: Some(Box::new(on_complete)),
        });
    }

    pub fn set_requested_rate_kbps(&self, kbps: u32) {
        self.requested_kbps.store(kbps, Ordering::Release);
    }

    pub fn set_rate_limit_kbps(&self, kbps: u64) {
        self.rate_limit_kbps.store(kbps, Ordering::Release);
    }

    pub fn pending_transfers(&self) -> usize {
        self.queue.lock().len()
    }

    /// Bytes this sender may emit during one tick, `None` when unlimited.
    pub fn bytes_allowed_this_tick(&self) -> Option<usize> {
        let limits = [
            self.rate_limit_kbps.load(Ordering::Acquire),
            u64::from(self.requested_kbps.load(Ordering::Acquire)),
            self.bandwidth.share_kbps().unwrap_or(0),
        ];
        let kbps = limits.into_iter().filter(|l| *l > 0).min()?;
        let per_tick = kbps.saturating_mul(1000) / u64::from(self.config.tick_rate_hz);
        Some(usize::try_from(per_tick).unwrap_or(usize::MAX).max(1))
    }

    /// Sends what this tick's budget allows and returns the bytes sent.
    ///
    /// A tick already in progress on another thread makes this a no-op.
    pub fn tick(&self) -> Result<usize, TransferError> {
        let Some(_ticking) = self.tick_lock.try_lock() else {
            return Ok(0);
        };

        let budget = self.bytes_allowed_this_tick();
        let has_work = !self.queue.lock().is_empty();
        self.bandwidth.set_active(has_work && budget != Some(0));
        if !has_work {
            return Ok(0);
        }

        let mut remaining = budget.unwrap_or(usize::MAX);
        let mut sent = 0;
        while remaining > 0 {
            // only the ticking thread advances or pops the front transfer
            let segment = {
                let queue = self.queue.lock();
                let Some(front) = queue.front() else {
                    break;
                };
                let len = remaining
                    .min(self.config.segment_size)
                    .min(front.remaining());
                SegmentMessage {
                    transfer_id: front.id,
                    is_first: front.cursor == 0,
                    payload: front.payload.slice(front.cursor..front.cursor + len),
                }
            };
            let len = segment.payload.len();
            let transfer_id = segment.transfer_id;
            self.sink.send_segment(segment)?;
            tracing::debug!(transfer_id, len, "Sent segment");

            remaining -= len;
            sent += len;

            let completed = {
                let mut queue = self.queue.lock();
                match queue.front_mut() {
                    Some(front) => {
                        front.cursor += len;
                        if front.remaining() == 0 {
                            queue.pop_front()
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            if let Some(mut done) = completed {
                tracing::debug!(transfer_id = done.id, "Transfer fully sent");
                if let Some(on_complete) = done.on_complete.take() {
                    on_complete();
                }
            }
        }
        Ok(sent)
    }

    /// Drops every queued transfer without running its completion callback.
    pub fn clear(&self) {
        self.queue.lock().clear();
        self.bandwidth.set_active(false);
    }
}

impl<S: TransferSink> Tick for ChunkedTransferSender<S> {
    fn tick(&self) {
        if let Err(error) = ChunkedTransferSender::tick(self) {
            tracing::warn!(%error, "Failed sending segment");
        }
    }
}
