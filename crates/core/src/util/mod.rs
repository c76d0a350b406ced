pub mod keyed_lock;
pub mod rolling_average;
pub mod ticker;
pub mod time_source;

pub use keyed_lock::{KeyGuard, KeyedLocks};
pub use rolling_average::RollingAverage;
pub use ticker::{PeriodicTicker, Tick, TickHandle};
pub use time_source::{InstantTimeSrc, SharedMockTimeSource, TimeSource};
