//! Fixed-size native thread pool backing one executor.
//!
//! Workers are spawned once and block on a shared crossbeam channel. The pool
//! is never resized: a new thread count means a new pool, and the old one is
//! shut down once it has drained the jobs already handed to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::SchedulerError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    name: String,
    /// `None` once shut down; dropping the sender lets idle workers exit.
    work_sender: Mutex<Option<Sender<Job>>>,
    /// Kept to discard queued jobs on a forced shutdown.
    work_receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self, SchedulerError> {
        let size = size.max(1);
        let (work_sender, work_receiver) = unbounded::<Job>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = work_receiver.clone();
            let cancelled = cancelled.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(receiver, cancelled))
                .map_err(|source| SchedulerError::PoolSpawn {
                    executor: name.to_string(),
                    source,
                })?;
            workers.push(handle);
        }

        tracing::debug!(executor = name, pool_size = size, "Created worker pool");

        Ok(Self {
            name: name.to_string(),
            work_sender: Mutex::new(Some(work_sender)),
            work_receiver,
            workers: Mutex::new(workers),
            cancelled,
        })
    }

    /// Hands a job to the workers. Fails once the pool is shut down; the job
    /// is dropped without running.
    pub fn execute(&self, job: Job) -> Result<(), SchedulerError> {
        let sender = self.work_sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| SchedulerError::ShutDown),
            None => Err(SchedulerError::ShutDown),
        }
    }

    /// Stops accepting jobs; already accepted jobs still run.
    pub fn shutdown(&self) {
        if self.work_sender.lock().take().is_some() {
            tracing::debug!(executor = %self.name, "Worker pool shutting down");
        }
    }

    /// Waits for every worker to exit after [`WorkerPool::shutdown`].
    ///
    /// Returns `false` if some worker was still busy when the timeout passed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let terminated = self.workers.lock().iter().all(|w| w.is_finished());
            if terminated {
                for worker in self.workers.lock().drain(..) {
                    let _ = worker.join();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Shuts down and discards every job not yet picked up by a worker.
    ///
    /// Jobs already running are not interrupted. Returns the number of
    /// discarded jobs.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        self.cancelled.store(true, Ordering::SeqCst);
        let discarded = self.work_receiver.try_iter().count();
        if discarded > 0 {
            tracing::warn!(executor = %self.name, discarded, "Discarded queued jobs");
        }
        discarded
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // workers exit once the channel disconnects and drains
        self.work_sender.get_mut().take();
    }
}

fn worker_loop(receiver: Receiver<Job>, cancelled: Arc<AtomicBool>) {
    while let Ok(job) = receiver.recv() {
        if cancelled.load(Ordering::SeqCst) {
            drop(job);
            continue;
        }
        if let Err(panic_info) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            tracing::error!(panic = %panic_msg, "Worker caught panic during task execution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_jobs_on_named_threads() -> testresult::TestResult {
        let pool = WorkerPool::new("unit", 2)?;
        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.execute(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        }))?;

        let name = rx.recv_timeout(Duration::from_secs(5))?;
        assert!(name.is_some_and(|n| n.starts_with("unit-worker-")));
        Ok(())
    }

    #[test]
    fn test_graceful_shutdown_drains_accepted_jobs() -> testresult::TestResult {
        let pool = WorkerPool::new("drain", 2)?;
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            pool.execute(Box::new(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            }))?;
        }

        pool.shutdown();
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(SchedulerError::ShutDown)
        ));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 10);
        Ok(())
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() -> testresult::TestResult {
        let pool = WorkerPool::new("panics", 1)?;
        pool.execute(Box::new(|| panic!("boom")))?;

        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.execute(Box::new(move || {
            let _ = tx.send(());
        }))?;
        rx.recv_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    #[test]
    fn test_shutdown_now_discards_queued_jobs() -> testresult::TestResult {
        let pool = WorkerPool::new("forced", 1)?;
        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
        pool.execute(Box::new(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))?;
        started_rx.recv_timeout(Duration::from_secs(5))?;

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            pool.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))?;
        }

        pool.shutdown();
        assert!(!pool.await_termination(Duration::from_millis(20)));
        assert_eq!(pool.shutdown_now(), 3);
        release_tx.send(())?;
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
