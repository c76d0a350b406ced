//! Fair scheduling of background work across named executors.
//!
//! Each [`Executor`] owns a FIFO of pending tasks and a worker pool sized by
//! the shared [`ThreadBudget`]. A scheduling pass runs on every submission and
//! every completion: executors are visited in ascending order of the total
//! time their tasks have run so far, and each may start at most
//! `max(1, threads / 2)` tasks per pass, so one busy executor cannot take
//! every thread while others wait.
//!
//! Passes never block. A thread that finds another pass in progress leaves a
//! rerun request for it and returns.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::config::ThreadBudget;

mod executor;
mod worker_pool;

pub use executor::{Executor, TaskId};
use executor::ExecutorInner;
use worker_pool::WorkerPool;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("executor {executor} rejected the task")]
    Rejected { executor: String },
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("failed spawning worker thread for {executor}: {source}")]
    PoolSpawn {
        executor: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) struct SchedulerInner {
    budget: Arc<ThreadBudget>,
    executors: RwLock<Vec<Arc<ExecutorInner>>>,
    schedule_lock: Mutex<()>,
    /// Set by any thread that wants a pass; cleared by the thread running it.
    rerun: AtomicBool,
    occupied: AtomicUsize,
    shutting_down: AtomicBool,
    next_task_id: AtomicU64,
}

impl SchedulerInner {
    pub(crate) fn thread_budget(&self) -> &ThreadBudget {
        &self.budget
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn release_thread(&self) {
        self.occupied.fetch_sub(1, Ordering::AcqRel);
    }

    /// Starts queued tasks while threads are free.
    pub(crate) fn try_start_next_tasks(self: &Arc<Self>) -> Result<(), SchedulerError> {
        loop {
            self.rerun.store(true, Ordering::SeqCst);
            let Some(_picking) = self.schedule_lock.try_lock() else {
                // the holder sees the rerun flag before releasing
                return Ok(());
            };
            self.rerun.store(false, Ordering::SeqCst);
            let result = self.dispatch();
            drop(_picking);
            result?;
            if !self.rerun.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    /// Runs rounds until the threads are full or a round starts nothing.
    ///
    /// Executors are re-ranked before every round, so work left over by the
    /// per-round cap goes to whoever is least serviced by then.
    fn dispatch(self: &Arc<Self>) -> Result<(), SchedulerError> {
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }
            let threads = self.budget.get();
            let started = self.dispatch_round(threads)?;
            if started == 0 || self.occupied.load(Ordering::Acquire) >= threads {
                return Ok(());
            }
        }
    }

    /// Returns how many tasks were started.
    fn dispatch_round(self: &Arc<Self>, threads: usize) -> Result<usize, SchedulerError> {
        let mut total_started = 0;
        let max_per_round = (threads / 2).max(1);
        let executors = self
            .executors
            .read()
            .iter()
            .cloned()
            .sorted_by_key(|e| e.total_runtime_nanos())
            .collect::<Vec<_>>();

        for executor in executors {
            let mut started = 0;
            while started < max_per_round && self.occupied.load(Ordering::Acquire) < threads {
                let Some(task) = executor.queue.lock().pop_front() else {
                    break;
                };
                started += 1;
                total_started += 1;
                self.occupied.fetch_add(1, Ordering::AcqRel);
                executor.running.fetch_add(1, Ordering::AcqRel);
                let job = executor.wrap(task, Arc::downgrade(self));

                if let Err(error) = executor.pool.load().execute(job) {
                    if self.is_shutting_down() {
                        // nothing queued will run any more
                        executor.queue.lock().clear();
                        break;
                    }
                    tracing::error!(%error, executor = %executor.name, "Worker pool rejected task");
                    return Err(SchedulerError::Rejected {
                        executor: executor.name.clone(),
                    });
                }
            }
        }
        Ok(total_started)
    }

    /// Swaps every executor onto a fresh pool of `threads` workers.
    fn replace_pools(self: &Arc<Self>, threads: usize) {
        {
            // no pass may hand work to a pool that is being retired
            let _picking = self.schedule_lock.lock();
            for executor in self.executors.read().iter() {
                match WorkerPool::new(&executor.name, threads) {
                    Ok(pool) => {
                        let old = executor.pool.swap(Arc::new(pool));
                        old.shutdown();
                    }
                    Err(error) => {
                        tracing::error!(%error, executor = %executor.name, "Keeping previous worker pool");
                    }
                }
            }
        }
        if let Err(error) = self.try_start_next_tasks() {
            tracing::error!(%error, "Failed starting tasks after pool replacement");
        }
    }
}

/// Owner of every executor and of the shared thread budget.
#[derive(Clone)]
pub struct FairScheduler {
    inner: Arc<SchedulerInner>,
}

impl FairScheduler {
    pub fn new(budget: Arc<ThreadBudget>) -> Self {
        let inner = Arc::new(SchedulerInner {
            budget: Arc::clone(&budget),
            executors: RwLock::new(Vec::new()),
            schedule_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            occupied: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            next_task_id: AtomicU64::new(0),
        });
        let weak: Weak<SchedulerInner> = Arc::downgrade(&inner);
        budget.subscribe(move |threads| {
            if let Some(inner) = weak.upgrade() {
                inner.replace_pools(threads);
            }
        });
        Self { inner }
    }

    /// Registers a new named queue.
    pub fn create_executor(&self, name: impl Into<String>) -> Result<Executor, SchedulerError> {
        let name = name.into();
        let pool = WorkerPool::new(&name, self.inner.budget.get())?;
        let executor = Arc::new(ExecutorInner::new(name, pool));
        self.inner.executors.write().push(Arc::clone(&executor));
        Ok(Executor {
            inner: executor,
            scheduler: Arc::clone(&self.inner),
        })
    }

    pub fn thread_budget(&self) -> &ThreadBudget {
        &self.inner.budget
    }

    /// Threads currently running a task, across all executors.
    pub fn occupied_threads(&self) -> usize {
        self.inner.occupied.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// One line per executor: running/completed tasks, average run time and
    /// queue length.
    pub fn status_lines(&self) -> Vec<String> {
        self.executors()
            .into_iter()
            .map(|executor| executor.status_line())
            .collect()
    }

    fn executors(&self) -> Vec<Executor> {
        self.inner
            .executors
            .read()
            .iter()
            .map(|inner| Executor {
                inner: Arc::clone(inner),
                scheduler: Arc::clone(&self.inner),
            })
            .collect()
    }

    /// Stops every executor.
    ///
    /// Queued tasks are dropped and running ones get up to `grace` per
    /// executor to finish; whatever is still pending after that is discarded.
    /// Returns `false` if some executor had to be forced down.
    pub fn shutdown(&self, grace: Duration) -> bool {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        tracing::info!("Shutting down scheduler thread pools");

        let executors = self.inner.executors.read().clone();
        for executor in &executors {
            executor.accepting.store(false, Ordering::Release);
            executor.queue.lock().clear();
            executor.pool.load().shutdown();
        }

        let mut graceful = true;
        for executor in &executors {
            let pool = executor.pool.load_full();
            if !pool.await_termination(grace) {
                tracing::warn!(
                    executor = %executor.name,
                    ?grace,
                    "Executor did not stop in time, cancelling remaining work"
                );
                pool.shutdown_now();
                graceful = false;
            }
        }
        graceful
    }
}
