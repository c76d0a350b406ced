/// Pipeline configuration: command line, environment and config files.
pub mod config;

/// Bounded, distance-ordered update queues.
pub mod queue;

/// Write-behind caching of per-key updates.
pub mod save_cache;

/// Fair scheduling of background work across executors.
pub mod scheduler;

/// Session scope owning every pipeline component.
pub mod session;

/// Logging infrastructure.
pub mod tracing;

/// Segmented payload streaming with congestion control and shared bandwidth.
pub mod transport;

/// Pre-stage change detection and main-stage processing of updates.
pub mod update;

pub mod util;

pub use config::{ConfigArgs, PipelineConfig};
pub use session::{PipelineSession, SessionStatus};
