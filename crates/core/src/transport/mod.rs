//! Segmented payload streaming with congestion feedback.
//!
//! A [`ChunkedTransferSender`] slices queued payloads into segments and paces
//! them by the tightest of its own cap, the rate requested by the receiving
//! side's [`AimdController`] and its share of a [`SharedBandwidthLimit`]. The
//! [`ChunkedReceiver`] stitches the segments back together.

pub mod bandwidth;
pub mod congestion;
mod errors;
pub mod message;
pub mod receiver;
pub mod sender;

pub use bandwidth::{SenderBandwidthHandle, SenderId, SharedBandwidthLimit};
pub use congestion::{AimdConfig, AimdController};
pub use errors::TransferError;
pub use message::{SegmentMessage, TransferComplete, TransferId, TransferIdGenerator};
pub use receiver::ChunkedReceiver;
pub use sender::{ChunkedTransferSender, SenderConfig, TransferSink};
