//! pool
//!
//! The portable threadpool. Worker threads are spawned on demand while the backlog exceeds the
//! number of idle workers, up to a maximum. Workers above the minimum retire after sitting idle.

use crate::{
    common::{instance::run_guarded, CallbackInstance},
    countdown::CountdownEvent,
    error::{Error, Result},
    event::EventError,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    fmt, io, mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace, warn};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Configure portable threadpool behavior. Native threadpools honor the thread limits only.
#[derive(Debug, Clone)]
pub struct ThreadpoolOptions {
    /// Worker threads are named `{name}-{n}`
    pub name: String,
    /// Workers started eagerly and never retired
    pub min_threads: usize,
    /// Upper bound of concurrently running workers (at least 1)
    pub max_threads: usize,
    /// Bound the pending queue. Submissions fail with [`Error::QueueFull`] when full
    pub max_pending: Option<usize>,
    /// How long a worker above the minimum may sit idle before it retires
    pub idle_timeout: Duration,
    /// Stack size of spawned workers. `None` uses the platform default
    pub stack_size: Option<usize>,
}

impl Default for ThreadpoolOptions {
    fn default() -> Self {
        Self {
            name: String::from("threadpool"),
            min_threads: 0,
            max_threads: num_cpus::get().max(4),
            max_pending: None,
            idle_timeout: Duration::from_secs(5),
            stack_size: None,
        }
    }
}

/// Something a portable threadpool can execute
pub(crate) trait Runnable: Send + Sync {
    /// The submission was accepted. Called under the pool lock, before the task is visible to
    /// workers
    fn enqueued(&self);
    /// Run the callback
    fn run(&self, instance: &CallbackInstance<'_>);
    /// The callback returned (or panicked)
    fn completed(&self);
    /// The submission was removed from the queue before it started
    fn cancelled(&self);
    /// The callback is expected to block for a long time
    fn runs_long(&self) -> bool {
        false
    }
}

/// A queued submission. `key` groups submissions of the same work item for cancellation
pub(crate) struct Task {
    key: usize,
    runnable: Arc<dyn Runnable>,
}

impl Task {
    pub(crate) fn new(key: usize, runnable: Arc<dyn Runnable>) -> Self {
        Self { key, runnable }
    }
}

struct PoolState {
    pending: VecDeque<Task>,
    closing: bool,
    threads: Vec<JoinHandle<()>>,
    /// Workers that have not exited
    live: usize,
    /// Workers blocked waiting for work
    idle: usize,
    /// Total workers ever spawned (used for naming)
    spawned: usize,
    min: usize,
    max: usize,
    stack_size: Option<usize>,
}

/// State shared between a portable threadpool handle and its workers
pub(crate) struct PoolShared {
    id: usize,
    name: String,
    max_pending: Option<usize>,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
    /// Signaled when work is queued or the pool is closing
    available: Condvar,
    /// One count per queued or running submission
    completion: CountdownEvent,
}

impl PoolShared {
    /// Create a portable pool. No worker is started until work is queued or [`Self::set_min`] is
    /// called
    pub(crate) fn new(options: ThreadpoolOptions) -> Arc<Self> {
        let max = options.max_threads.max(1);
        let min = options.min_threads.min(max);
        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: options.name,
            max_pending: options.max_pending,
            idle_timeout: options.idle_timeout,
            state: Mutex::new(PoolState {
                pending: VecDeque::new(),
                closing: false,
                threads: Vec::new(),
                live: 0,
                idle: 0,
                spawned: 0,
                min,
                max,
                stack_size: options.stack_size,
            }),
            available: Condvar::new(),
            completion: CountdownEvent::new(0),
        });
        debug!(pool = %shared.name, id = shared.id, min, max, "threadpool created");
        shared
    }

    /// Queue a submission. Either the submission is queued and counted, or nothing changes
    pub(crate) fn enqueue(self: &Arc<Self>, task: Task) -> Result<()> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Error::Closed);
        }
        if let Some(capacity) = self.max_pending {
            if state.pending.len() >= capacity {
                trace!(pool = %self.name, capacity, "threadpool queue full");
                return Err(Error::QueueFull);
            }
        }

        // Grow while the backlog exceeds the idle workers
        if state.idle <= state.pending.len() && state.live < state.max {
            if let Err(e) = self.spawn_worker(&mut state) {
                if state.live == 0 {
                    return Err(e.into());
                }
                warn!(pool = %self.name, error = %e, "failed to grow threadpool");
            }
        }

        task.runnable.enqueued();
        self.completion.add_count(1);
        state.pending.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Remove every queued submission with `key`. Submissions already running are unaffected.
    /// Returns the number of cancelled submissions
    pub(crate) fn cancel(&self, key: usize) -> usize {
        let mut cancelled = Vec::new();
        {
            let mut state = self.state.lock();
            state.pending.retain(|task| match task.key == key {
                true => {
                    cancelled.push(Arc::clone(&task.runnable));
                    false
                }
                false => true,
            });
        }
        for runnable in &cancelled {
            self.completion.decrement(1);
            runnable.cancelled();
        }
        if !cancelled.is_empty() {
            trace!(pool = %self.name, key, count = cancelled.len(), "cancelled pending callbacks");
        }
        cancelled.len()
    }

    /// Make sure a worker other than the caller is available to service the queue
    pub(crate) fn make_worker_available(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_spare_worker(&mut state)
    }

    fn ensure_spare_worker(self: &Arc<Self>, state: &mut PoolState) -> Result<()> {
        if state.idle > 0 {
            return Ok(());
        }
        if state.closing || state.live >= state.max {
            return Err(Error::Busy);
        }
        self.spawn_worker(state).map_err(Error::from)
    }

    pub(crate) fn set_min(self: &Arc<Self>, min: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.min = min;
        if state.max < min {
            state.max = min;
        }
        while state.live < state.min && !state.closing {
            self.spawn_worker(&mut state)?;
        }
        Ok(())
    }

    pub(crate) fn set_max(&self, max: usize) {
        let mut state = self.state.lock();
        state.max = max.max(1);
        if state.min > state.max {
            state.min = state.max;
        }
        // Surplus workers retire after their current callback
        drop(state);
        self.available.notify_all();
    }

    pub(crate) fn set_stack_size(&self, size: usize) {
        self.state.lock().stack_size = Some(size);
    }

    /// Number of queued or running submissions
    pub(crate) fn outstanding(&self) -> usize {
        self.completion.count()
    }

    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> std::result::Result<(), EventError> {
        self.completion.wait(timeout)
    }

    /// Stop accepting work, drain the queue and join every worker. The calling thread is never
    /// joined, so a callback may close its own pool.
    pub(crate) fn close(&self) {
        let threads = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            mem::take(&mut state.threads)
        };
        self.available.notify_all();
        debug!(pool = %self.name, workers = threads.len(), "closing threadpool");

        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "threadpool worker panicked");
            }
        }
        debug!(pool = %self.name, "threadpool closed");
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> io::Result<()> {
        state.threads.retain(|handle| !handle.is_finished());
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.name, state.spawned));
        if let Some(size) = state.stack_size {
            builder = builder.stack_size(size);
        }
        let shared = Arc::clone(self);
        let handle = builder.spawn(move || worker_loop(shared))?;
        state.threads.push(handle);
        state.spawned += 1;
        state.live += 1;
        trace!(pool = %self.name, live = state.live, "spawned threadpool worker");
        Ok(())
    }

    fn execute(self: &Arc<Self>, task: Task) {
        let instance = CallbackInstance::portable(self);
        run_guarded(|| task.runnable.run(&instance));
        instance.complete();
        self.completion.decrement(1);
        task.runnable.completed();
    }
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

/// Worker thread main loop
fn worker_loop(shared: Arc<PoolShared>) {
    trace!(pool = %shared.name, "threadpool worker started");
    let mut state = shared.state.lock();
    loop {
        // Surplus after max_threads was lowered
        if state.live > state.max {
            break;
        }
        if let Some(task) = state.pending.pop_front() {
            if task.runnable.runs_long() && !state.pending.is_empty() {
                if let Err(e) = shared.ensure_spare_worker(&mut state) {
                    trace!(pool = %shared.name, error = %e, "no spare worker for long callback");
                }
            }
            MutexGuard::unlocked(&mut state, || shared.execute(task));
            continue;
        }
        if state.closing {
            break;
        }

        state.idle += 1;
        let timeout = shared.available.wait_for(&mut state, shared.idle_timeout);
        state.idle -= 1;
        if timeout.timed_out()
            && state.pending.is_empty()
            && !state.closing
            && state.live > state.min
        {
            trace!(pool = %shared.name, "retiring idle threadpool worker");
            break;
        }
    }
    state.live -= 1;
    let backlog = !state.pending.is_empty();
    trace!(pool = %shared.name, live = state.live, "threadpool worker exited");
    drop(state);
    if backlog {
        // The wakeup for the backlog may have reached this worker
        shared.available.notify_one();
    }
}
