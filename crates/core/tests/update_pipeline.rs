use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunkflow::queue::{AddOutcome, QueuedItem, UpdateQueueManager, WorkKey};
use chunkflow::update::{ChangeDetector, Collaborators, NeighborSource, UpdateProcessor, WorkRequest};
use chunkflow::{PipelineConfig, PipelineSession};
use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn capacity_holds_under_concurrent_producers_and_consumers() {
    const MAX: usize = 64;
    let manager = Arc::new(UpdateQueueManager::<u32>::new(MAX));
    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));

    let observer = {
        let manager = manager.clone();
        let stop = stop.clone();
        let violations = violations.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if manager.queued_count() > MAX {
                    violations.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };
    let consumer = {
        let manager = manager.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if manager.pop_closest_main().is_none() {
                    manager.pop_closest_pre();
                }
                thread::yield_now();
            }
        })
    };

    let producers: Vec<_> = (0..8u64)
        .map(|seed| {
            let manager = manager.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed);
                for i in 0..2_000u32 {
                    let item = QueuedItem::new(
                        WorkKey::new(rng.gen_range(-100..100), rng.gen_range(-100..100)),
                        i,
                    );
                    if rng.gen_bool(0.5) {
                        manager.add_to_pre_stage(item);
                    } else {
                        manager.add_to_main_stage(item);
                    }
                    assert!(manager.queued_count() <= MAX);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer panicked");
    }
    stop.store(true, Ordering::Relaxed);
    observer.join().expect("observer panicked");
    consumer.join().expect("consumer panicked");

    assert_eq!(violations.load(Ordering::Relaxed), 0);
    assert!(manager.queued_count() <= MAX);
}

#[test]
fn overflow_drops_the_furthest_candidate() {
    const MAX: usize = 16;
    for seed in 0..50 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let center = WorkKey::new(rng.gen_range(-10..10), rng.gen_range(-10..10));
        let manager = UpdateQueueManager::<()>::new(MAX);
        manager.set_center(center);

        let mut candidates = HashSet::new();
        while candidates.len() < MAX + 1 {
            candidates.insert(WorkKey::new(rng.gen_range(-40..40), rng.gen_range(-40..40)));
        }
        for key in &candidates {
            let outcome = manager.add_to_pre_stage(QueuedItem::new(*key, ()));
            assert_ne!(outcome, AddOutcome::Duplicate);
        }
        assert_eq!(manager.queued_count(), MAX);

        let furthest = candidates
            .iter()
            .map(|k| k.squared_distance(&center))
            .max()
            .expect("candidates are not empty");
        let dropped: Vec<_> = candidates
            .iter()
            .filter(|k| !manager.contains(k))
            .collect();
        assert_eq!(dropped.len(), 1, "seed {seed}");
        assert_eq!(dropped[0].squared_distance(&center), furthest, "seed {seed}");
    }
}

/// Payloads are their own content hash.
#[derive(Default)]
struct Terrain {
    saved: DashMap<WorkKey, u64>,
    loaded: DashMap<WorkKey, u64>,
    updates: AtomicUsize,
}

impl ChangeDetector<u64> for Terrain {
    fn last_known_hash(&self, key: WorkKey) -> anyhow::Result<Option<u64>> {
        Ok(self.saved.get(&key).map(|h| *h))
    }

    fn current_hash(&self, payload: &u64) -> u64 {
        *payload
    }
}

impl NeighborSource<u64> for Terrain {
    fn fetch(&self, key: WorkKey) -> Option<u64> {
        self.loaded.get(&key).map(|h| *h)
    }
}

impl UpdateProcessor<u64> for Terrain {
    fn process(&self, item: QueuedItem<u64>) -> anyhow::Result<()> {
        thread::sleep(Duration::from_micros(100));
        self.saved.insert(item.key, item.payload);
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn open_session(terrain: &Arc<Terrain>) -> Result<PipelineSession<u64>, chunkflow::scheduler::SchedulerError> {
    PipelineSession::open(
        PipelineConfig {
            thread_count: 3,
            ..PipelineConfig::default()
        },
        Collaborators {
            detector: terrain.clone(),
            neighbors: terrain.clone(),
            processor: terrain.clone(),
        },
    )
}

#[test_log::test]
fn session_processes_concurrent_requests_once_per_change() -> testresult::TestResult {
    let terrain = Arc::new(Terrain::default());
    let session = Arc::new(open_session(&terrain)?);

    // an isolated 10x10 block, so neighbor refreshes stay inside it
    let keys: Vec<_> = (0..10)
        .flat_map(|x| (0..10).map(move |z| WorkKey::new(x * 4, z * 4)))
        .collect();
    for key in &keys {
        terrain.loaded.insert(*key, 1);
    }

    let producers: Vec<_> = keys
        .chunks(25)
        .map(|chunk| {
            let session = session.clone();
            let chunk = chunk.to_vec();
            thread::spawn(move || -> Result<(), chunkflow::scheduler::SchedulerError> {
                for key in chunk {
                    session
                        .pipeline()
                        .request_update(WorkRequest::new(key, 1).with_neighborhood(false))?;
                }
                Ok(())
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer panicked")?;
    }
    assert!(wait_until(Duration::from_secs(10), || session.pipeline().is_idle()));
    assert_eq!(terrain.saved.len(), keys.len());
    let first_round = session.pipeline().stats();
    assert_eq!(first_round.failed, 0);

    // same content again is filtered by the change check
    for key in &keys {
        session.pipeline().request_update(WorkRequest::new(*key, 1))?;
    }
    assert!(wait_until(Duration::from_secs(10), || session.pipeline().is_idle()));
    let second_round = session.pipeline().stats();
    assert_eq!(second_round.processed, first_round.processed);
    assert_eq!(
        second_round.unchanged - first_round.unchanged,
        keys.len() as u64
    );

    assert!(session.close());
    assert!(session.is_closed());
    Ok(())
}

#[test]
fn requests_after_close_are_accepted_but_never_run() -> testresult::TestResult {
    let terrain = Arc::new(Terrain::default());
    let session = open_session(&terrain)?;
    session.close();

    let outcome = session
        .pipeline()
        .request_update(WorkRequest::new(WorkKey::new(0, 0), 9))?;
    assert!(outcome.is_inserted());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(terrain.updates.load(Ordering::Relaxed), 0);
    Ok(())
}
