use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::worker_pool::{Job, WorkerPool};
use super::{SchedulerError, SchedulerInner};
use crate::util::rolling_average::RollingAverage;

/// Number of run times kept for the average shown in status output.
const RUN_TIME_SAMPLES: usize = 200;

/// Identity of a submitted task, used to cancel it before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub task: Job,
}

pub(crate) struct ExecutorInner {
    pub name: String,
    pub queue: Mutex<VecDeque<QueuedTask>>,
    pub pool: ArcSwap<WorkerPool>,
    pub running: AtomicUsize,
    pub completed: AtomicU64,
    pub total_runtime_nanos: AtomicU64,
    run_times_ms: Mutex<RollingAverage>,
    pub accepting: AtomicBool,
}

impl ExecutorInner {
    pub fn new(name: String, pool: WorkerPool) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            pool: ArcSwap::from_pointee(pool),
            running: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            total_runtime_nanos: AtomicU64::new(0),
            run_times_ms: Mutex::new(RollingAverage::new(RUN_TIME_SAMPLES)),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn total_runtime_nanos(&self) -> u64 {
        self.total_runtime_nanos.load(Ordering::Acquire)
    }

    fn record_run(&self, elapsed: Duration) {
        self.total_runtime_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::AcqRel,
        );
        self.run_times_ms
            .lock()
            .add_value(elapsed.as_secs_f64() * 1000.0);
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Wraps a dequeued task with its completion accounting.
    pub fn wrap(self: &Arc<Self>, task: QueuedTask, scheduler: Weak<SchedulerInner>) -> Job {
        let mut guard = CompletionGuard {
            executor: Arc::clone(self),
            scheduler,
            started: None,
        };
        Box::new(move || {
            guard.started = Some(Instant::now());
            (task.task)();
        })
    }
}

/// Releases the thread slot of a dispatched task when dropped.
///
/// Dropping happens after the task returns, while unwinding from a panic, or
/// when a job is discarded before it ran. Only a task that started counts as
/// completed and hands its slot to the next queued task.
struct CompletionGuard {
    executor: Arc<ExecutorInner>,
    scheduler: Weak<SchedulerInner>,
    started: Option<Instant>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.executor.running.fetch_sub(1, Ordering::AcqRel);
        // the run is recorded before the slot is freed so the next pass ranks
        // executors on up to date totals
        if let Some(started) = self.started {
            self.executor.record_run(started.elapsed());
        }
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        scheduler.release_thread();
        if self.started.is_some() {
            if let Err(error) = scheduler.try_start_next_tasks() {
                tracing::error!(%error, executor = %self.executor.name, "Failed starting next task");
            }
        }
    }
}

/// Handle for submitting work to one named queue of a
/// [`FairScheduler`](super::FairScheduler).
#[derive(Clone)]
pub struct Executor {
    pub(crate) inner: Arc<ExecutorInner>,
    pub(crate) scheduler: Arc<SchedulerInner>,
}

impl Executor {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues a task and immediately tries to start queued work.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<TaskId, SchedulerError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(if self.scheduler.is_shutting_down() {
                SchedulerError::ShutDown
            } else {
                SchedulerError::Rejected {
                    executor: self.inner.name.clone(),
                }
            });
        }
        let id = self.scheduler.next_task_id();
        self.inner.queue.lock().push_back(QueuedTask {
            id,
            task: Box::new(task),
        });
        self.scheduler.try_start_next_tasks()?;
        Ok(id)
    }

    /// Cancels a task that has not started yet; returns whether it was
    /// still queued.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.retain(|queued| queued.id != id);
        queue.len() != before
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Threads available to this executor's pool.
    pub fn pool_size(&self) -> usize {
        self.scheduler.thread_budget().get()
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn completed_tasks(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Rolling average of recent run times, `NaN` before any task finished.
    pub fn average_run_time_ms(&self) -> f64 {
        self.inner.run_times_ms.lock().average()
    }

    pub fn total_runtime_nanos(&self) -> u64 {
        self.inner.total_runtime_nanos()
    }

    pub fn status_line(&self) -> String {
        let avg = self.average_run_time_ms();
        let avg = if avg.is_nan() {
            "-".to_string()
        } else {
            format!("{avg:.2}")
        };
        format!(
            "{}: {}/{} tasks, avg {} ms, queued {}",
            self.name(),
            self.running_tasks(),
            self.completed_tasks(),
            avg,
            self.queue_size()
        )
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.inner.name)
            .field("queued", &self.queue_size())
            .field("running", &self.running_tasks())
            .finish()
    }
}
