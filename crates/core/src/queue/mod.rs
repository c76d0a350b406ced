//! Distance-ordered update queues.

pub mod manager;
pub mod overload;
pub mod position;
pub mod work_key;

pub use manager::{AddOutcome, EvictionPolicy, QueueStatus, UpdateQueueManager};
pub use overload::{LogOverloadSink, OverloadEvent, OverloadNotifier, OverloadSink};
pub use position::PositionQueue;
pub use work_key::{QueuedItem, WorkKey};
