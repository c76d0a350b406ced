//! Message shapes exchanged between a chunked sender and its receiver.
//!
//! Framing is left to the carrying transport; these types only fix the
//! fields each side relies on.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type TransferId = u32;

/// One slice of a transferred payload.
///
/// Segments of a transfer arrive in order and the first one is flagged, so
/// the receiver can start a fresh buffer without knowing the total size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMessage {
    pub transfer_id: TransferId,
    pub is_first: bool,
    pub payload: Bytes,
}

/// Out-of-band signal that every segment of a transfer has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferComplete {
    pub transfer_id: TransferId,
}

/// Hands out transfer ids that are unique among concurrently open
/// transfers of one sender.
#[derive(Debug, Default)]
pub struct TransferIdGenerator(AtomicU32);

impl TransferIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> TransferId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Serializes an artifact for transfer; the counterpart of
/// [`ChunkedReceiver::decode`](super::receiver::ChunkedReceiver::decode).
pub fn encode<T: Serialize>(artifact: &T) -> Result<Bytes, bincode::Error> {
    bincode::serialize(artifact).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let ids = TransferIdGenerator::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_segment_message_survives_bincode() -> testresult::TestResult {
        let msg = SegmentMessage {
            transfer_id: 42,
            is_first: true,
            payload: Bytes::from_static(b"chunk data"),
        };
        let bytes = bincode::serialize(&msg)?;
        let back: SegmentMessage = bincode::deserialize(&bytes)?;
        assert_eq!(back, msg);
        Ok(())
    }
}
