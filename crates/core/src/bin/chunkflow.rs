//! Runs the pipeline against a synthetic world.
//!
//! Producer threads request updates around a center that drifts once per
//! second, while a sender streams serialized artifacts to an in-process
//! receiver whose congestion controller paces it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use chunkflow::config::{set_logger, ConfigArgs};
use chunkflow::queue::{QueuedItem, WorkKey};
use chunkflow::save_cache::{DelayedSaveCache, Mergeable, SaveHandler};
use chunkflow::transport::message::encode;
use chunkflow::transport::{
    AimdController, ChunkedReceiver, SegmentMessage, TransferComplete, TransferError,
    TransferIdGenerator,
};
use chunkflow::update::{
    ChangeDetector, Collaborators, NeighborSource, UpdateProcessor, WorkRequest,
};
use chunkflow::PipelineSession;
use clap::Parser;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "chunkflow", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// How long to run the workload.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Threads requesting updates concurrently.
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Entries in each streamed artifact (8 bytes each).
    #[arg(long, default_value_t = 32_768)]
    artifact_entries: usize,

    /// Simulated cost of processing one update.
    #[arg(long, default_value_t = 500)]
    work_micros: u64,

    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChunkSummary {
    updates: u32,
    hash: u64,
}

impl Mergeable for ChunkSummary {
    fn empty(_key: WorkKey) -> Self {
        Self::default()
    }

    fn merge_from(&mut self, update: &Self) {
        self.updates += update.updates;
        self.hash = update.hash;
    }
}

struct CountingSaver(Arc<AtomicU64>);

impl SaveHandler<ChunkSummary> for CountingSaver {
    fn save(&self, key: WorkKey, data: ChunkSummary) {
        tracing::trace!(%key, updates = data.updates, "Saved chunk summary");
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Payloads are content hashes.
struct SyntheticWorld {
    saved_hashes: DashMap<WorkKey, u64>,
    loaded: DashMap<WorkKey, u64>,
    cache: Arc<DelayedSaveCache<ChunkSummary, CountingSaver>>,
    work: Duration,
}

impl ChangeDetector<u64> for SyntheticWorld {
    fn last_known_hash(&self, key: WorkKey) -> anyhow::Result<Option<u64>> {
        Ok(self.saved_hashes.get(&key).map(|h| *h))
    }

    fn current_hash(&self, payload: &u64) -> u64 {
        *payload
    }
}

impl NeighborSource<u64> for SyntheticWorld {
    fn fetch(&self, key: WorkKey) -> Option<u64> {
        self.loaded.get(&key).map(|h| *h)
    }
}

impl UpdateProcessor<u64> for SyntheticWorld {
    fn process(&self, item: QueuedItem<u64>) -> anyhow::Result<()> {
        thread::sleep(self.work);
        self.saved_hashes.insert(item.key, item.payload);
        self.cache.write(
            item.key,
            &ChunkSummary {
                updates: 1,
                hash: item.payload,
            },
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
enum WireMessage {
    Segment(SegmentMessage),
    Complete(TransferComplete),
}

fn spawn_producer(
    id: usize,
    session: Arc<PipelineSession<u64>>,
    world: Arc<SyntheticWorld>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("producer-{id}"))
        .spawn(move || {
            let mut rng = SmallRng::seed_from_u64(id as u64);
            while !stop.load(Ordering::Relaxed) {
                let center = session.pipeline().center();
                let key = WorkKey::new(
                    center.x + rng.gen_range(-32..=32),
                    center.z + rng.gen_range(-32..=32),
                );
                // some requests repeat the saved content and should be skipped
                let known = world.saved_hashes.get(&key).map(|h| *h);
                let hash = match known {
                    Some(hash) if rng.gen_bool(0.3) => hash,
                    _ => rng.gen(),
                };
                world.loaded.insert(key, hash);

                let mut request = WorkRequest::new(key, hash);
                if rng.gen_bool(0.5) {
                    request = request.with_neighborhood(rng.gen_bool(0.2));
                }
                if let Err(error) = session.pipeline().request_update(request) {
                    tracing::error!(%error, "Update request failed");
                }
                thread::sleep(Duration::from_micros(200));
            }
        })
}

fn spawn_receiver_loop(
    wire: Receiver<Bytes>,
    receiver: Arc<ChunkedReceiver>,
    controller: Arc<AimdController>,
    decoded: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("receiver".to_string())
        .spawn(move || loop {
            let frame = match wire.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) if stop.load(Ordering::Relaxed) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match bincode::deserialize::<WireMessage>(&frame) {
                Ok(WireMessage::Segment(segment)) => {
                    controller.on_payload_received(segment.payload.len());
                    receiver.receive_segment(segment);
                }
                Ok(WireMessage::Complete(done)) => {
                    match receiver.decode::<Vec<u64>>(done.transfer_id) {
                        Ok(artifact) => {
                            decoded.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                transfer_id = done.transfer_id,
                                entries = artifact.len(),
                                "Decoded artifact"
                            );
                        }
                        Err(error) => tracing::warn!(%error, "Undecodable artifact"),
                    }
                }
                Err(error) => tracing::warn!(%error, "Malformed frame"),
            }
        })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.build().context("invalid configuration")?;
    tracing::info!(?config, "Starting synthetic workload");

    let saves = Arc::new(AtomicU64::new(0));
    let world = Arc::new(SyntheticWorld {
        saved_hashes: DashMap::new(),
        loaded: DashMap::new(),
        cache: Arc::new(DelayedSaveCache::new(
            CountingSaver(saves.clone()),
            config.save_delay,
        )),
        work: Duration::from_micros(cli.work_micros),
    });
    let collaborators = Collaborators {
        detector: world.clone(),
        neighbors: world.clone(),
        processor: world.clone(),
    };
    let session = Arc::new(
        PipelineSession::open(config, collaborators).context("failed opening session")?,
    );
    let _cache_handle = session.register_maintenance(world.cache.clone());

    let (wire_tx, wire_rx) = crossbeam::channel::unbounded::<Bytes>();
    let segment_tx = wire_tx.clone();
    let (sender, _sender_handle) =
        session.register_sender(move |segment: SegmentMessage| -> Result<(), TransferError> {
            let frame =
                encode(&WireMessage::Segment(segment)).map_err(|_| TransferError::SinkClosed)?;
            segment_tx.send(frame).map_err(|_| TransferError::SinkClosed)
        });
    let rate_sender = sender.clone();
    let (controller, _controller_handle) =
        session.register_controller(move |kbps| rate_sender.set_requested_rate_kbps(kbps));
    let (receiver, _receiver_handle) = session.register_receiver();
    session.spawn_tickers();

    let stop = Arc::new(AtomicBool::new(false));
    let decoded = Arc::new(AtomicU64::new(0));
    let receiver_loop =
        spawn_receiver_loop(wire_rx, receiver, controller, decoded.clone(), stop.clone())
            .context("failed spawning receiver")?;
    let producers = (0..cli.producers)
        .map(|id| spawn_producer(id, session.clone(), world.clone(), stop.clone()))
        .collect::<Result<Vec<_>, _>>()
        .context("failed spawning producers")?;

    let ids = Arc::new(TransferIdGenerator::new());
    let started = Instant::now();
    let deadline = Duration::from_secs(cli.duration_secs);
    let mut status_tick = tokio::time::interval(Duration::from_secs(1));
    let mut transfer_tick = tokio::time::interval(Duration::from_millis(250));
    let mut step = 0;
    while started.elapsed() < deadline {
        tokio::select! {
            _ = status_tick.tick() => {
                session.pipeline().set_center(WorkKey::new(step, step / 2));
                step += 1;
                println!("{}\n", session.status());
            }
            _ = transfer_tick.tick() => {
                let sender = sender.clone();
                let ids = ids.clone();
                let wire = wire_tx.clone();
                let entries = cli.artifact_entries as u64;
                session.transfer_executor().execute(move || {
                    let artifact: Vec<u64> = (0..entries).collect();
                    match encode(&artifact) {
                        Ok(bytes) => {
                            let transfer_id = ids.next_id();
                            sender.enqueue(transfer_id, bytes, move || {
                                let done = WireMessage::Complete(TransferComplete { transfer_id });
                                if let Ok(frame) = encode(&done) {
                                    let _ = wire.send(frame);
                                }
                            });
                        }
                        Err(error) => tracing::error!(%error, "Failed serializing artifact"),
                    }
                })?;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let closing = session.clone();
    let graceful = tokio::task::spawn_blocking(move || {
        for producer in producers {
            let _ = producer.join();
        }
        let graceful = closing.close();
        // tickers are stopped, so the wire goes quiet and the receiver exits
        let _ = receiver_loop.join();
        graceful
    })
    .await
    .context("shutdown task failed")?;
    sender.clear();
    let flushed = world.cache.flush();

    println!("{}\n", session.status());
    println!(
        "Finished: {} artifacts decoded, {} summaries saved ({} on flush), graceful shutdown: {}",
        decoded.load(Ordering::Relaxed),
        saves.load(Ordering::Relaxed),
        flushed,
        graceful
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    set_logger(cli.log_level, cli.json_logs)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed building tokio runtime")?;
    rt.block_on(run(cli))
}
