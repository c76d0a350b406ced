use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::{ChangeDetector, NeighborSource, UpdateProcessor, WorkRequest};
use crate::config::{PipelineConfig, ThreadBudget};
use crate::queue::{
    AddOutcome, LogOverloadSink, OverloadNotifier, OverloadSink, QueueStatus, QueuedItem,
    UpdateQueueManager, WorkKey,
};
use crate::scheduler::{Executor, SchedulerError};

/// External collaborators doing the domain work of an [`UpdatePipeline`].
pub struct Collaborators<P> {
    pub detector: Arc<dyn ChangeDetector<P>>,
    pub neighbors: Arc<dyn NeighborSource<P>>,
    pub processor: Arc<dyn UpdateProcessor<P>>,
}

impl<P> Clone for Collaborators<P> {
    fn clone(&self) -> Self {
        Self {
            detector: Arc::clone(&self.detector),
            neighbors: Arc::clone(&self.neighbors),
            processor: Arc::clone(&self.processor),
        }
    }
}

/// Counters of what happened to promoted and processed updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
}

struct PipelineInner<P> {
    manager: UpdateQueueManager<P>,
    executor: Executor,
    budget: Arc<ThreadBudget>,
    collaborators: Collaborators<P>,
    change_detection: AtomicBool,
    per_thread_budget: usize,
    consumers: AtomicUsize,
    counters: Counters,
}

/// Feeds requested updates through the pre and main stages on an executor.
pub struct UpdatePipeline<P> {
    inner: Arc<PipelineInner<P>>,
}

impl<P> Clone for UpdatePipeline<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> UpdatePipeline<P> {
    pub fn new(
        executor: Executor,
        budget: Arc<ThreadBudget>,
        config: &PipelineConfig,
        collaborators: Collaborators<P>,
    ) -> Self {
        Self::with_overload_sink(executor, budget, config, collaborators, Arc::new(LogOverloadSink))
    }

    pub fn with_overload_sink(
        executor: Executor,
        budget: Arc<ThreadBudget>,
        config: &PipelineConfig,
        collaborators: Collaborators<P>,
        sink: Arc<dyn OverloadSink>,
    ) -> Self {
        let manager = UpdateQueueManager::with_notifier(
            1,
            config.eviction_policy,
            OverloadNotifier::new(config.overload_log_cooldown, sink),
        );
        manager.recompute_max_size(budget.get(), config.max_queued_per_thread_per_consumer, 1);
        Self {
            inner: Arc::new(PipelineInner {
                manager,
                executor,
                budget,
                collaborators,
                change_detection: AtomicBool::new(config.change_detection),
                per_thread_budget: config.max_queued_per_thread_per_consumer,
                consumers: AtomicUsize::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Queues an update in the pre stage unless the key is already queued.
    ///
    /// A processing pass is submitted only while the executor has fewer
    /// queued passes than threads; running passes resubmit themselves until
    /// the queues are empty.
    pub fn request_update(&self, request: WorkRequest<P>) -> Result<AddOutcome, SchedulerError> {
        if self.inner.manager.contains(&request.key) {
            return Ok(AddOutcome::Duplicate);
        }
        let outcome = self.inner.manager.add_to_pre_stage(request.into());

        let executor = &self.inner.executor;
        if executor.queue_size() < executor.pool_size() {
            self.inner.submit_pass()?;
        }
        Ok(outcome)
    }

    pub fn set_center(&self, center: WorkKey) {
        self.inner.manager.set_center(center);
    }

    pub fn center(&self) -> WorkKey {
        self.inner.manager.center()
    }

    /// Number of consumers (players) the queue capacity scales with.
    pub fn set_consumer_count(&self, consumers: usize) {
        self.inner
            .consumers
            .store(consumers.max(1), Ordering::Release);
        self.inner.update_max_size();
    }

    pub fn set_change_detection(&self, enabled: bool) {
        self.inner.change_detection.store(enabled, Ordering::Release);
    }

    /// Drops every queued update. Passes already running finish their item.
    pub fn clear(&self) {
        self.inner.manager.clear();
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.manager.status()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.manager.is_empty()
            && self.inner.executor.queue_size() == 0
            && self.inner.executor.running_tasks() == 0
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.inner.counters;
        PipelineStats {
            processed: counters.processed.load(Ordering::Relaxed),
            unchanged: counters.unchanged.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl<P: Send + 'static> PipelineInner<P> {
    fn submit_pass(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let pipeline: Weak<Self> = Arc::downgrade(self);
        let submitted = self.executor.execute(move || {
            if let Some(pipeline) = pipeline.upgrade() {
                pipeline.process_queue();
            }
        });
        match submitted {
            Ok(_) => Ok(()),
            Err(SchedulerError::ShutDown) => {
                tracing::trace!("Scheduler shutting down, update pass not submitted");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn update_max_size(&self) -> usize {
        self.manager.recompute_max_size(
            self.budget.get(),
            self.per_thread_budget,
            self.consumers.load(Ordering::Acquire),
        )
    }

    /// One pre-stage step and one main-stage step, then a resubmission while
    /// work remains.
    fn process_queue(self: &Arc<Self>) {
        self.update_max_size();
        self.pre_update_step();
        self.main_step();

        if !self.manager.is_empty() {
            if let Err(error) = self.submit_pass() {
                tracing::error!(%error, "Failed resubmitting update pass");
            }
        }
    }

    fn pre_update_step(&self) {
        let Some(item) = self.manager.pop_closest_pre() else {
            return;
        };
        let key = item.key;
        if let Err(error) = self.promote(item) {
            tracing::error!(%key, %error, "Unexpected error when pre-updating");
        }
    }

    fn promote(&self, item: QueuedItem<P>) -> anyhow::Result<()> {
        if self.change_detection.load(Ordering::Acquire) {
            let detector = &self.collaborators.detector;
            let previous = detector.last_known_hash(item.key)?;
            if previous == Some(detector.current_hash(&item.payload)) {
                self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %item.key, "Skipping unchanged update");
                return Ok(());
            }
        }

        // neighbors skip the pre stage so they cannot trigger further promotions
        if let Some(neighbors) = &item.neighbors {
            for &neighbor in neighbors.iter().filter(|&&k| k != item.key) {
                let Some(payload) = self.collaborators.neighbors.fetch(neighbor) else {
                    continue;
                };
                let mut refreshed = QueuedItem::new(neighbor, payload);
                if item.expand_neighbors {
                    refreshed = refreshed.with_neighbors(neighbor.neighborhood().collect(), true);
                }
                self.manager.add_to_main_stage(refreshed);
            }
        }

        self.manager.add_to_main_stage(item);
        Ok(())
    }

    fn main_step(&self) {
        let Some(item) = self.manager.pop_closest_main() else {
            return;
        };
        let key = item.key;
        match self.collaborators.processor.process(item) {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%key, error = %format!("{error:#}"), "Unexpected error when updating");
            }
        }
    }
}
