//! Reassembly of segmented payloads.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;

use super::errors::TransferError;
use super::message::{SegmentMessage, TransferId};
use crate::util::ticker::Tick;
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Idle time after which a partial buffer is discarded.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

struct ReassemblyBuffer {
    segments: Vec<Bytes>,
    len: usize,
    last_access: Instant,
}

impl ReassemblyBuffer {
    fn new(first: Bytes, now: Instant) -> Self {
        Self {
            len: first.len(),
            segments: vec![first],
            last_access: now,
        }
    }

    fn into_bytes(mut self) -> Bytes {
        if self.segments.len() == 1 {
            return self.segments.remove(0);
        }
        let mut out = BytesMut::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out.freeze()
    }
}

/// Collects segments per transfer until the completion signal arrives.
///
/// Segments of one transfer must arrive in order, starting with the one
/// flagged `is_first`. Transfer ids must not be reused while a transfer is
/// still open.
pub struct ChunkedReceiver<T: TimeSource = InstantTimeSrc> {
    buffers: DashMap<TransferId, ReassemblyBuffer>,
    timeout: Duration,
    time_source: T,
}

impl ChunkedReceiver<InstantTimeSrc> {
    pub fn new(timeout: Duration) -> Self {
        Self::new_with_time_source(timeout, InstantTimeSrc::new())
    }
}

impl<T: TimeSource> ChunkedReceiver<T> {
    pub fn new_with_time_source(timeout: Duration, time_source: T) -> Self {
        Self {
            buffers: DashMap::new(),
            timeout,
            time_source,
        }
    }

    /// Appends a segment, returning whether it was kept.
    ///
    /// A first segment always starts a fresh buffer, discarding any stale one
    /// under the same id. Other segments without a live buffer are dropped:
    /// the payload cannot be rebuilt and has to be requested again.
    pub fn receive_segment(&self, segment: SegmentMessage) -> bool {
        let now = self.time_source.now();
        let SegmentMessage {
            transfer_id,
            is_first,
            payload,
        } = segment;

        if is_first {
            let len = payload.len();
            if self
                .buffers
                .insert(transfer_id, ReassemblyBuffer::new(payload, now))
                .is_some()
            {
                tracing::debug!(transfer_id, "Replaced stale reassembly buffer");
            }
            tracing::debug!(transfer_id, len, "Created reassembly buffer");
            return true;
        }

        match self.buffers.entry(transfer_id) {
            Entry::Occupied(entry) if self.is_expired(entry.get(), now) => {
                entry.remove();
                tracing::debug!(transfer_id, "Dropped segment for expired buffer");
                false
            }
            Entry::Occupied(mut entry) => {
                let buffer = entry.get_mut();
                buffer.len += payload.len();
                buffer.segments.push(payload);
                buffer.last_access = now;
                tracing::debug!(transfer_id, len = buffer.len, "Appended segment");
                true
            }
            Entry::Vacant(_) => {
                tracing::debug!(
                    transfer_id,
                    len = payload.len(),
                    "Dropped non-first segment without a buffer"
                );
                false
            }
        }
    }

    /// Removes the buffer and returns the reassembled payload, if a live one
    /// exists.
    pub fn take(&self, transfer_id: TransferId) -> Result<Bytes, TransferError> {
        self.remove_live(transfer_id)
            .ok_or(TransferError::MissingBuffer { transfer_id })
    }

    /// Removes the buffer and deserializes the payload.
    ///
    /// Only call once the completion signal for the transfer has arrived.
    ///
    /// # Panics
    ///
    /// When no live buffer exists for `transfer_id`. A completion signal
    /// without its segments means the caller sequenced the transfer wrong.
    pub fn decode<D: DeserializeOwned>(&self, transfer_id: TransferId) -> Result<D, TransferError> {
        let Some(bytes) = self.remove_live(transfer_id) else {
            panic!("transfer {transfer_id} completed without a reassembly buffer");
        };
        bincode::deserialize(&bytes).map_err(|source| TransferError::Decode {
            transfer_id,
            source,
        })
    }

    fn remove_live(&self, transfer_id: TransferId) -> Option<Bytes> {
        let now = self.time_source.now();
        match self.buffers.remove(&transfer_id) {
            Some((_, buffer)) if !self.is_expired(&buffer, now) => Some(buffer.into_bytes()),
            _ => {
                tracing::error!(
                    transfer_id,
                    "Transfer completed without a reassembly buffer"
                );
                None
            }
        }
    }

    /// Discards buffers idle longer than the timeout; returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = self.time_source.now();
        let before = self.buffers.len();
        self.buffers.retain(|transfer_id, buffer| {
            let keep = !self.is_expired(buffer, now);
            if !keep {
                tracing::debug!(transfer_id, "Evicted idle reassembly buffer");
            }
            keep
        });
        before.saturating_sub(self.buffers.len())
    }

    pub fn pending_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&self) {
        self.buffers.clear();
    }

    fn is_expired(&self, buffer: &ReassemblyBuffer, now: Instant) -> bool {
        now.saturating_duration_since(buffer.last_access) >= self.timeout
    }
}

impl<T: TimeSource> Tick for ChunkedReceiver<T> {
    fn tick(&self) {
        self.evict_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time_source::SharedMockTimeSource;

    fn segment(transfer_id: TransferId, is_first: bool, payload: &'static [u8]) -> SegmentMessage {
        SegmentMessage {
            transfer_id,
            is_first,
            payload: Bytes::from_static(payload),
        }
    }

    fn receiver() -> (ChunkedReceiver<SharedMockTimeSource>, SharedMockTimeSource) {
        let clock = SharedMockTimeSource::new();
        (
            ChunkedReceiver::new_with_time_source(DEFAULT_REASSEMBLY_TIMEOUT, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_segments_are_concatenated_in_order() -> testresult::TestResult {
        let (receiver, _) = receiver();
        assert!(receiver.receive_segment(segment(1, true, b"hello ")));
        assert!(receiver.receive_segment(segment(1, false, b"chunked ")));
        assert!(receiver.receive_segment(segment(1, false, b"world")));

        assert_eq!(receiver.take(1)?, Bytes::from_static(b"hello chunked world"));
        assert_eq!(receiver.pending_buffers(), 0);
        Ok(())
    }

    #[test]
    fn test_non_first_without_buffer_is_dropped() {
        let (receiver, _) = receiver();
        assert!(!receiver.receive_segment(segment(5, false, b"orphan")));
        assert_eq!(receiver.pending_buffers(), 0);
    }

    #[test]
    fn test_first_segment_replaces_stale_buffer() -> testresult::TestResult {
        let (receiver, _) = receiver();
        receiver.receive_segment(segment(2, true, b"old"));
        receiver.receive_segment(segment(2, false, b"-partial"));
        receiver.receive_segment(segment(2, true, b"new"));

        assert_eq!(receiver.take(2)?, Bytes::from_static(b"new"));
        Ok(())
    }

    #[test]
    fn test_idle_buffers_expire() {
        let (receiver, clock) = receiver();
        receiver.receive_segment(segment(1, true, b"a"));
        receiver.receive_segment(segment(2, true, b"b"));

        clock.advance_time(Duration::from_secs(6));
        receiver.receive_segment(segment(2, false, b"c"));
        clock.advance_time(Duration::from_secs(5));

        assert_eq!(receiver.evict_expired(), 1);
        assert_eq!(receiver.pending_buffers(), 1);
        assert!(!receiver.receive_segment(segment(1, false, b"late")));
    }

    #[test]
    fn test_segment_for_expired_buffer_is_dropped_before_eviction() {
        let (receiver, clock) = receiver();
        receiver.receive_segment(segment(1, true, b"a"));
        clock.advance_time(DEFAULT_REASSEMBLY_TIMEOUT);

        assert!(!receiver.receive_segment(segment(1, false, b"b")));
        assert_eq!(receiver.pending_buffers(), 0);
    }

    #[test]
    fn test_take_without_buffer_is_an_error() {
        let (receiver, _) = receiver();
        assert!(matches!(
            receiver.take(77),
            Err(TransferError::MissingBuffer { transfer_id: 77 })
        ));
    }

    #[test]
    fn test_decode_artifact() -> testresult::TestResult {
        let (receiver, _) = receiver();
        let artifact: Vec<u64> = (0..1000).collect();
        let encoded = crate::transport::message::encode(&artifact)?;
        let (head, tail) = encoded.split_at(100);

        receiver.receive_segment(SegmentMessage {
            transfer_id: 4,
            is_first: true,
            payload: Bytes::copy_from_slice(head),
        });
        receiver.receive_segment(SegmentMessage {
            transfer_id: 4,
            is_first: false,
            payload: Bytes::copy_from_slice(tail),
        });

        let decoded: Vec<u64> = receiver.decode(4)?;
        assert_eq!(decoded, artifact);
        assert_eq!(receiver.pending_buffers(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "transfer 42 completed without a reassembly buffer")]
    fn test_decode_without_buffer_panics() {
        let (receiver, _) = receiver();
        let _ = receiver.decode::<Vec<u64>>(42);
    }

    #[test]
    #[should_panic(expected = "transfer 9 completed without a reassembly buffer")]
    fn test_decode_of_expired_buffer_panics() {
        let (receiver, clock) = receiver();
        receiver.receive_segment(segment(9, true, b"stale"));
        clock.advance_time(DEFAULT_REASSEMBLY_TIMEOUT);
        let _ = receiver.decode::<Vec<u8>>(9);
    }

    #[test]
    fn test_truncated_payload_fails_to_decode() -> testresult::TestResult {
        let (receiver, _) = receiver();
        let encoded = crate::transport::message::encode(&vec![1u64, 2, 3])?;
        receiver.receive_segment(SegmentMessage {
            transfer_id: 1,
            is_first: true,
            payload: encoded.slice(..encoded.len() - 4),
        });
        assert!(matches!(
            receiver.decode::<Vec<u64>>(1),
            Err(TransferError::Decode { .. })
        ));
        Ok(())
    }
}
