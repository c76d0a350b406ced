//! One bounded "world session": every component of the pipeline, built from
//! one [`PipelineConfig`] and torn down together by [`PipelineSession::close`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{PipelineConfig, ThreadBudget};
use crate::queue::QueueStatus;
use crate::save_cache::CLEANUP_CHECK_INTERVAL;
use crate::scheduler::{Executor, FairScheduler, SchedulerError};
use crate::transport::{
    AimdConfig, AimdController, ChunkedReceiver, ChunkedTransferSender, SenderConfig,
    SharedBandwidthLimit, TransferSink,
};
use crate::update::{Collaborators, PipelineStats, UpdatePipeline};
use crate::util::{PeriodicTicker, Tick, TickHandle};

pub const UPDATE_EXECUTOR: &str = "chunk-update";
pub const TRANSFER_EXECUTOR: &str = "transfer";

pub struct PipelineSession<P> {
    config: PipelineConfig,
    budget: Arc<ThreadBudget>,
    scheduler: FairScheduler,
    transfer_executor: Executor,
    pipeline: UpdatePipeline<P>,
    bandwidth: Arc<SharedBandwidthLimit>,
    /// Drives senders and congestion controllers at the sender tick rate.
    transfer_ticker: PeriodicTicker,
    /// Drives save caches and reassembly expiry.
    maintenance_ticker: PeriodicTicker,
    ticker_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<P: Send + 'static> PipelineSession<P> {
    pub fn open(
        config: PipelineConfig,
        collaborators: Collaborators<P>,
    ) -> Result<Self, SchedulerError> {
        let budget = Arc::new(ThreadBudget::new(config.thread_count));
        let scheduler = FairScheduler::new(Arc::clone(&budget));
        let update_executor = scheduler.create_executor(UPDATE_EXECUTOR)?;
        let transfer_executor = scheduler.create_executor(TRANSFER_EXECUTOR)?;
        let pipeline =
            UpdatePipeline::new(update_executor, Arc::clone(&budget), &config, collaborators);
        let bandwidth = Arc::new(SharedBandwidthLimit::new(config.global_bandwidth_limit_kbps));
        let tick_period = Duration::from_secs(1) / config.sender_tick_rate_hz.max(1);

        tracing::info!(
            threads = config.thread_count,
            global_limit_kbps = config.global_bandwidth_limit_kbps,
            "Opened pipeline session"
        );
        Ok(Self {
            transfer_ticker: PeriodicTicker::new("transfer", tick_period),
            maintenance_ticker: PeriodicTicker::new("maintenance", CLEANUP_CHECK_INTERVAL),
            ticker_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
            budget,
            scheduler,
            transfer_executor,
            pipeline,
            bandwidth,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &UpdatePipeline<P> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &FairScheduler {
        &self.scheduler
    }

    /// Executor for serializing artifacts before they are streamed.
    pub fn transfer_executor(&self) -> &Executor {
        &self.transfer_executor
    }

    pub fn bandwidth(&self) -> &Arc<SharedBandwidthLimit> {
        &self.bandwidth
    }

    /// Builds a sender sharing this session's bandwidth limit and drives it
    /// at the configured tick rate while the handle is alive.
    pub fn register_sender<S: TransferSink + 'static>(
        &self,
        sink: S,
    ) -> (Arc<ChunkedTransferSender<S>>, TickHandle) {
        let sender = Arc::new(ChunkedTransferSender::new(
            sink,
            SenderConfig {
                segment_size: self.config.segment_size_bytes,
                tick_rate_hz: self.config.sender_tick_rate_hz,
                rate_limit_kbps: self.config.per_connection_rate_limit_kbps,
            },
            Arc::clone(&self.bandwidth),
        ));
        let handle = self.transfer_ticker.register(sender.clone());
        (sender, handle)
    }

    /// Builds a receiver whose abandoned buffers expire in the background.
    pub fn register_receiver(&self) -> (Arc<ChunkedReceiver>, TickHandle) {
        let receiver = Arc::new(ChunkedReceiver::new(self.config.reassembly_timeout));
        let handle = self.maintenance_ticker.register(receiver.clone());
        (receiver, handle)
    }

    /// Builds a congestion controller reporting each new rate in KB/s.
    pub fn register_controller(
        &self,
        on_rate_changed: impl Fn(u32) + Send + Sync + 'static,
    ) -> (Arc<AimdController>, TickHandle) {
        let controller = Arc::new(
            AimdController::new(AimdConfig::with_interval(self.config.congestion_interval))
                .on_rate_changed(on_rate_changed),
        );
        let handle = self.transfer_ticker.register(controller.clone());
        (controller, handle)
    }

    /// Registers any component needing cleanup once per
    /// [`CLEANUP_CHECK_INTERVAL`], save caches in particular.
    pub fn register_maintenance(&self, entry: Arc<dyn Tick>) -> TickHandle {
        self.maintenance_ticker.register(entry)
    }

    /// Starts the background tickers on the current tokio runtime.
    pub fn spawn_tickers(&self) {
        let mut tasks = self.ticker_tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.transfer_ticker.spawn());
        tasks.push(self.maintenance_ticker.spawn());
    }

    /// Runs every registered component once, without the tokio tickers.
    pub fn tick_once(&self) {
        self.transfer_ticker.tick_all();
        self.maintenance_ticker.tick_all();
    }

    pub fn set_thread_count(&self, threads: usize) -> bool {
        self.budget.set(threads)
    }

    pub fn set_global_bandwidth_limit_kbps(&self, kbps: u64) {
        self.bandwidth.set_global_limit_kbps(kbps);
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            queue: self.pipeline.status(),
            stats: self.pipeline.stats(),
            executors: self.scheduler.status_lines(),
            active_senders: self.bandwidth.active_senders(),
            global_limit_kbps: self.bandwidth.global_limit_kbps(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drops queued updates, stops the tickers and shuts the scheduler down,
    /// giving running tasks the configured grace period.
    ///
    /// Blocks while waiting for worker threads; call it from a blocking
    /// context. Returns `false` if some work had to be cancelled.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.pipeline.clear();
        for task in self.ticker_tasks.lock().drain(..) {
            task.abort();
        }
        let graceful = self.scheduler.shutdown(self.config.shutdown_grace);
        tracing::info!(graceful, "Closed pipeline session");
        graceful
    }
}

/// Text status surface of a session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub queue: QueueStatus,
    pub stats: PipelineStats,
    pub executors: Vec<String>,
    pub active_senders: usize,
    pub global_limit_kbps: u64,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.queue)?;
        writeln!(
            f,
            "Updates: {} processed, {} unchanged, {} failed",
            self.stats.processed, self.stats.unchanged, self.stats.failed
        )?;
        for line in &self.executors {
            writeln!(f, "{line}")?;
        }
        match self.global_limit_kbps {
            0 => write!(f, "Bandwidth: {} active senders, unlimited", self.active_senders),
            limit => write!(
                f,
                "Bandwidth: {} active senders, {} KB/s shared",
                self.active_senders, limit
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueuedItem, WorkKey};
    use crate::transport::{SegmentMessage, TransferError};
    use crate::update::{ChangeDetector, NeighborSource, WorkRequest};
    use bytes::Bytes;

    struct Always;

    impl ChangeDetector<u8> for Always {
        fn last_known_hash(&self, _key: WorkKey) -> anyhow::Result<Option<u64>> {
            Ok(None)
        }

        fn current_hash(&self, payload: &u8) -> u64 {
            u64::from(*payload)
        }
    }

    impl NeighborSource<u8> for Always {
        fn fetch(&self, _key: WorkKey) -> Option<u8> {
            None
        }
    }

    fn session(threads: usize) -> PipelineSession<u8> {
        session_with(PipelineConfig {
            thread_count: threads,
            shutdown_grace: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn session_with(config: PipelineConfig) -> PipelineSession<u8> {
        let collaborators = Collaborators {
            detector: Arc::new(Always),
            neighbors: Arc::new(Always),
            processor: Arc::new(|_: QueuedItem<u8>| -> anyhow::Result<()> { Ok(()) }),
        };
        PipelineSession::open(config, collaborators).expect("session should open")
    }

    #[test]
    fn test_status_lists_both_executors() {
        let session = session(2);
        let status = session.status();
        assert_eq!(status.executors.len(), 2);
        assert!(status.executors[0].starts_with(UPDATE_EXECUTOR));
        assert!(status.executors[1].starts_with(TRANSFER_EXECUTOR));

        let text = status.to_string();
        assert!(text.starts_with("Queued chunk updates: ( 0 + 0 )  [ 0 / 2000 ]"));
        assert!(text.ends_with("Bandwidth: 0 active senders, unlimited"));
    }

    #[test]
    fn test_thread_count_change_resizes_queue_capacity() -> testresult::TestResult {
        let session = session(1);
        assert!(session.set_thread_count(3));
        assert!(!session.set_thread_count(3));
        session
            .pipeline()
            .request_update(WorkRequest::new(WorkKey::new(0, 0), 1))?;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.status().queue.max != 3_000 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(session.status().queue.max, 3_000);
        Ok(())
    }

    #[test]
    fn test_close_rejects_nothing_and_is_idempotent() -> testresult::TestResult {
        let session = session(1);
        assert!(session.close());
        assert!(session.is_closed());
        assert!(session.close());

        let outcome = session
            .pipeline()
            .request_update(WorkRequest::new(WorkKey::new(1, 1), 1))?;
        assert!(outcome.is_inserted());
        assert!(matches!(
            session.transfer_executor().execute(|| {}),
            Err(SchedulerError::ShutDown)
        ));
        Ok(())
    }

    #[test]
    fn test_tick_once_streams_registered_sender() -> testresult::TestResult {
        let session = session(1);
        let (receiver, _receiver_handle) = session.register_receiver();
        let sink_receiver = receiver.clone();
        let (sender, _sender_handle) =
            session.register_sender(move |segment: SegmentMessage| -> Result<(), TransferError> {
                sink_receiver.receive_segment(segment);
                Ok(())
            });

        let payload = Bytes::from(vec![7u8; 4_096]);
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        sender.enqueue(1, payload.clone(), move || {
            let _ = done_tx.send(());
        });

        session.tick_once();
        done_rx.try_recv()?;
        assert_eq!(receiver.take(1)?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_tickers_drive_controllers() {
        let session = session_with(PipelineConfig {
            thread_count: 1,
            congestion_interval: Duration::from_millis(50),
            ..Default::default()
        });
        let rates = Arc::new(Mutex::new(Vec::new()));
        let seen = rates.clone();
        let (controller, handle) = session.register_controller(move |kbps| seen.lock().push(kbps));
        session.spawn_tickers();

        controller.on_payload_received(50_000);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rates.lock().is_empty());

        drop(handle);
        let before = rates.lock().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rates.lock().len(), before);
    }
}
