//! Two-stage update processing on top of the bounded queue.
//!
//! Producers call [`UpdatePipeline::request_update`]; a pass running on the
//! `chunk-update` executor promotes pre-stage items whose content actually
//! changed and processes main-stage items closest to the center first.

mod pipeline;

pub use pipeline::{Collaborators, PipelineStats, UpdatePipeline};

use crate::queue::{QueuedItem, WorkKey};

/// Cheap content check deciding whether an update is worth processing.
pub trait ChangeDetector<P>: Send + Sync {
    /// Hash recorded the last time `key` was processed, `None` if it never was.
    fn last_known_hash(&self, key: WorkKey) -> anyhow::Result<Option<u64>>;

    fn current_hash(&self, payload: &P) -> u64;
}

/// Gives access to the current payload of a neighboring key.
pub trait NeighborSource<P>: Send + Sync {
    /// Fresh payload for `key`, `None` if it is not loaded.
    fn fetch(&self, key: WorkKey) -> Option<P>;
}

/// Performs the expensive work for one promoted update.
pub trait UpdateProcessor<P>: Send + Sync {
    fn process(&self, item: QueuedItem<P>) -> anyhow::Result<()>;
}

impl<P, F> UpdateProcessor<P> for F
where
    F: Fn(QueuedItem<P>) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, item: QueuedItem<P>) -> anyhow::Result<()> {
        self(item)
    }
}

/// A producer's request to update one key.
#[derive(Debug, Clone)]
pub struct WorkRequest<P> {
    pub key: WorkKey,
    pub payload: P,
    pub neighbors: Option<Vec<WorkKey>>,
    pub expand_neighbors: bool,
}

impl<P> WorkRequest<P> {
    pub fn new(key: WorkKey, payload: P) -> Self {
        Self {
            key,
            payload,
            neighbors: None,
            expand_neighbors: false,
        }
    }

    /// Requests the update together with its 3x3 neighborhood.
    pub fn with_neighborhood(mut self, expand_neighbors: bool) -> Self {
        self.neighbors = Some(self.key.neighborhood().collect());
        self.expand_neighbors = expand_neighbors;
        self
    }
}

impl<P> From<WorkRequest<P>> for QueuedItem<P> {
    fn from(request: WorkRequest<P>) -> Self {
        QueuedItem {
            key: request.key,
            payload: request.payload,
            neighbors: request.neighbors,
            expand_neighbors: request.expand_neighbors,
        }
    }
}
