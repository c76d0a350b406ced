use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunkflow::config::ThreadBudget;
use chunkflow::scheduler::{Executor, FairScheduler};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct StartSample {
    own_runtime: u64,
    other_runtime: u64,
    other_queued: usize,
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn equal_cost_task(
    me: Executor,
    other: Executor,
    samples: Arc<Mutex<Vec<StartSample>>>,
) -> impl FnOnce() + Send + 'static {
    move || {
        samples.lock().push(StartSample {
            own_runtime: me.total_runtime_nanos(),
            other_runtime: other.total_runtime_nanos(),
            other_queued: other.queue_size(),
        });
        thread::sleep(Duration::from_millis(2));
    }
}

#[test_log::test]
fn least_serviced_executor_always_runs_next() -> testresult::TestResult {
    const TASKS: usize = 40;

    let scheduler = FairScheduler::new(Arc::new(ThreadBudget::new(1)));
    let gate = scheduler.create_executor("gate")?;
    let a = scheduler.create_executor("a")?;
    let b = scheduler.create_executor("b")?;

    // hold the only thread until both queues are full
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    gate.execute(move || {
        let _ = release_rx.recv();
    })?;

    let samples = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..TASKS {
        a.execute(equal_cost_task(a.clone(), b.clone(), samples.clone()))?;
        b.execute(equal_cost_task(b.clone(), a.clone(), samples.clone()))?;
    }
    release_tx.send(())?;

    assert!(wait_until(Duration::from_secs(30), || {
        a.completed_tasks() + b.completed_tasks() == 2 * TASKS as u64
    }));

    let samples = samples.lock();
    assert_eq!(samples.len(), 2 * TASKS);
    for sample in samples.iter().filter(|s| s.other_queued > 0) {
        assert!(
            sample.own_runtime <= sample.other_runtime,
            "a more serviced executor ran while the other waited: {sample:?}"
        );
    }
    Ok(())
}

#[test]
fn cumulative_runtime_converges() -> testresult::TestResult {
    const TASKS: usize = 30;
    let task_cost = Duration::from_millis(3);

    let scheduler = FairScheduler::new(Arc::new(ThreadBudget::new(1)));
    let a = scheduler.create_executor("a")?;
    let b = scheduler.create_executor("b")?;

    let longest = Arc::new(Mutex::new(Duration::ZERO));
    for _ in 0..TASKS {
        for executor in [&a, &b] {
            let longest = longest.clone();
            executor.execute(move || {
                let started = Instant::now();
                thread::sleep(task_cost);
                let elapsed = started.elapsed();
                let mut longest = longest.lock();
                *longest = (*longest).max(elapsed);
            })?;
        }
    }

    assert!(wait_until(Duration::from_secs(30), || {
        a.completed_tasks() == TASKS as u64 && b.completed_tasks() == TASKS as u64
    }));

    // both drained the same number of equal tasks; what remains is jitter
    let difference = a.total_runtime_nanos().abs_diff(b.total_runtime_nanos());
    let bound = u64::try_from(longest.lock().as_nanos())? * TASKS as u64 / 2;
    assert!(
        difference <= bound,
        "runtime difference {difference}ns exceeds {bound}ns"
    );
    Ok(())
}

#[test]
fn busy_executor_cannot_take_every_thread() -> testresult::TestResult {
    let scheduler = FairScheduler::new(Arc::new(ThreadBudget::new(4)));
    let busy = scheduler.create_executor("busy")?;
    let quiet = scheduler.create_executor("quiet")?;

    let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
    for _ in 0..16 {
        let release_rx = release_rx.clone();
        busy.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        })?;
    }
    assert!(wait_until(Duration::from_secs(5), || busy.running_tasks() == 4));

    // the quiet executor gets the next free thread even though busy queued first
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    quiet.execute(move || {
        let _ = done_tx.send(());
    })?;
    release_tx.send(())?;
    done_rx.recv_timeout(Duration::from_secs(5))?;

    for _ in 0..16 {
        let _ = release_tx.send(());
    }
    assert!(wait_until(Duration::from_secs(10), || busy.completed_tasks() == 16));
    Ok(())
}
