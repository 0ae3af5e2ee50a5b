//! Background finalizer thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::CompletionCallback;
use crate::config::DEFAULT_WORKER_THREAD_NAME;
use crate::error::Result;
use crate::metrics::{ProcessorMetrics, ProcessorStats};
use crate::queue::FinalizerQueue;
use crate::state::Epoch;
use crate::sync::{LockGuard, LockOrder};
use crate::tracing;

type ThreadHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Tasks of one epoch waiting for the worker.
struct Segment {
    tasks: FinalizerQueue,
    epoch: Epoch,
}

struct Pending {
    /// One segment per distinct epoch, oldest first.
    segments: VecDeque<Segment>,
    shutdown: bool,
    /// Cleared by the worker when it exits on shutdown, re-opened by `stop_thread`.
    new_tasks_allowed: bool,
    /// A worker has been spawned and has not yet exited.
    worker_alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Idle,
    Starting,
    Ready,
}

struct Shared {
    pending: Mutex<Pending>,
    /// Signalled when segments are added or shutdown is requested.
    work_cond: Condvar,
    /// Signalled when `new_tasks_allowed` is re-opened.
    allowed_cond: Condvar,
    init: Mutex<InitState>,
    init_cond: Condvar,
    running: AtomicBool,
    on_finalized: CompletionCallback,
    metrics: ProcessorMetrics,
}

impl Shared {
    fn lock_pending(&self) -> (LockGuard, parking_lot::MutexGuard<'_, Pending>) {
        let order = LockGuard::new(LockOrder::PendingQueue);
        (order, self.pending.lock())
    }

    fn set_init(&self, state: InitState) {
        *self.init.lock() = state;
        self.init_cond.notify_all();
    }

    fn complete(&self, epoch: Epoch) {
        (self.on_finalized)(epoch);
        self.metrics.record_epoch_completed();
    }
}

/// Aborts the process if a finalizer unwinds out of the worker loop.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::log_worker_panic();
            std::process::abort();
        }
    }
}

/// Drains finalizer batches on one dedicated background thread.
///
/// The thread is started lazily by the first non-empty
/// [`schedule_tasks`](Self::schedule_tasks) (or explicitly with
/// [`start_thread_if_none_running`](Self::start_thread_if_none_running)) and
/// runs until [`stop_thread`](Self::stop_thread). Batches are drained in the
/// order they were scheduled and the completion callback fires once per
/// scheduled epoch, after every task of that epoch and before any task of a
/// later one. Finalizers run with no lock held, so scheduling never waits on
/// finalizer execution.
///
/// A panic escaping a finalizer aborts the process.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
/// use rudo_finalizer::{Epoch, FinalizerProcessor, FinalizerQueue};
///
/// let done = Arc::new(AtomicU64::new(0));
/// let report = Arc::clone(&done);
/// let processor = FinalizerProcessor::new(move |epoch: Epoch| {
///     report.store(epoch.0, Ordering::SeqCst);
/// });
///
/// let mut batch = FinalizerQueue::new();
/// batch.push_fn(|| println!("finalizing"));
/// processor.schedule_tasks(batch, Epoch(1)).unwrap();
///
/// processor.stop_thread();
/// assert_eq!(done.load(Ordering::SeqCst), 1);
/// assert!(!processor.is_thread_running());
/// ```
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
    stack_size: Option<usize>,
    thread_hook: Option<ThreadHook>,
}

impl FinalizerProcessor {
    /// Creates a stopped processor reporting completed epochs to `on_finalized`.
    pub fn new<F>(on_finalized: F) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        Self::with_callback(Arc::new(on_finalized))
    }

    /// Same as [`new`](Self::new) with an already shared callback.
    #[must_use]
    pub fn with_callback(on_finalized: CompletionCallback) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending {
                    segments: VecDeque::new(),
                    shutdown: false,
                    new_tasks_allowed: true,
                    worker_alive: false,
                }),
                work_cond: Condvar::new(),
                allowed_cond: Condvar::new(),
                init: Mutex::new(InitState::Idle),
                init_cond: Condvar::new(),
                running: AtomicBool::new(false),
                on_finalized,
                metrics: ProcessorMetrics::new(),
            }),
            worker: Mutex::new(None),
            thread_name: DEFAULT_WORKER_THREAD_NAME.to_owned(),
            stack_size: None,
            thread_hook: None,
        }
    }

    /// Names the worker thread.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets the stack size of the worker thread.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Runs `hook` on every new worker thread before it reports initialized.
    #[must_use]
    pub fn with_thread_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.thread_hook = Some(Arc::new(hook));
        self
    }

    /// Hands `tasks` over for `epoch`.
    ///
    /// An empty batch scheduled while no worker is alive completes right
    /// away: the callback runs on the calling thread and no thread is
    /// started. Otherwise the batch is queued behind everything scheduled
    /// before it and a worker is started if none is running.
    ///
    /// If a stop is in progress and the worker has already exited, this
    /// blocks until [`stop_thread`](Self::stop_thread) returns.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// worker thread could not be created. The batch stays queued and runs
    /// on the next successful start.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `epoch` is lower than the epoch of a batch
    /// still waiting to run.
    pub fn schedule_tasks(&self, tasks: FinalizerQueue, epoch: Epoch) -> Result<()> {
        {
            let (_order, mut pending) = self.shared.lock_pending();
            if tasks.is_empty() && !pending.worker_alive && pending.segments.is_empty() {
                // The lock stays held so that a concurrent start cannot
                // report a later epoch before this one.
                tracing::log_idle_completion(epoch);
                self.shared.complete(epoch);
                return Ok(());
            }
            while !pending.new_tasks_allowed {
                self.shared.allowed_cond.wait(&mut pending);
            }
            debug_assert!(
                pending.segments.back().is_none_or(|tail| tail.epoch <= epoch),
                "{epoch} scheduled after a later epoch"
            );
            match pending.segments.back_mut() {
                Some(tail) if tail.epoch == epoch => tail.tasks.merge_with(tasks),
                _ => pending.segments.push_back(Segment { tasks, epoch }),
            }
            self.shared.work_cond.notify_one();
        }
        self.start_thread_if_none_running()
    }

    /// Spawns the worker unless one is already running.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// OS refuses to create the thread.
    pub fn start_thread_if_none_running(&self) -> Result<()> {
        let _slot_order = LockGuard::new(LockOrder::WorkerSlot);
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }

        {
            let (_order, mut pending) = self.shared.lock_pending();
            pending.worker_alive = true;
            self.shared.running.store(true, Ordering::Release);
        }
        self.shared.set_init(InitState::Starting);

        let shared = Arc::clone(&self.shared);
        let hook = self.thread_hook.clone();
        let name = self.thread_name.clone();
        let mut builder = thread::Builder::new().name(self.thread_name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let spawned = builder.spawn(move || worker_main(&shared, hook.as_deref(), &name));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                self.shared.metrics.record_worker_start();
                Ok(())
            }
            Err(err) => {
                {
                    let (_order, mut pending) = self.shared.lock_pending();
                    pending.worker_alive = false;
                    self.shared.running.store(false, Ordering::Release);
                }
                self.shared.set_init(InitState::Idle);
                Err(err.into())
            }
        }
    }

    /// Blocks until a worker that is being started has run its thread hook.
    ///
    /// Returns immediately if no worker start is in progress.
    pub fn wait_thread_initialized(&self) {
        let mut init = self.shared.init.lock();
        while *init == InitState::Starting {
            self.shared.init_cond.wait(&mut init);
        }
    }

    /// Asks the worker to exit once it has drained everything queued, then
    /// joins it and re-opens scheduling so a later batch can restart it.
    ///
    /// Does nothing if no worker was started.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if batches are still queued after the join.
    pub fn stop_thread(&self) {
        let _slot_order = LockGuard::new(LockOrder::WorkerSlot);
        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return;
        };

        {
            let (_order, mut pending) = self.shared.lock_pending();
            pending.shutdown = true;
            self.shared.work_cond.notify_all();
        }

        // A panicking worker aborts the process, so the join result carries nothing.
        let _ = handle.join();

        let (_order, mut pending) = self.shared.lock_pending();
        debug_assert!(
            pending.segments.is_empty(),
            "finalizer worker exited with {} batches still queued",
            pending.segments.len()
        );
        pending.shutdown = false;
        pending.new_tasks_allowed = true;
        self.shared.allowed_cond.notify_all();
    }

    /// Whether a worker thread is alive. Never blocks.
    #[must_use]
    pub fn is_thread_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of epochs queued and not yet picked up by the worker.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        let (_order, pending) = self.shared.lock_pending();
        pending.segments.len()
    }

    /// Snapshot of this processor's counters.
    #[must_use]
    pub fn metrics(&self) -> ProcessorStats {
        self.shared.metrics.snapshot()
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

impl fmt::Debug for FinalizerProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerProcessor")
            .field("thread_name", &self.thread_name)
            .field("running", &self.is_thread_running())
            .finish_non_exhaustive()
    }
}

fn worker_main(shared: &Shared, hook: Option<&(dyn Fn() + Send + Sync)>, name: &str) {
    let _abort = AbortOnPanic;
    if let Some(hook) = hook {
        hook();
    }
    shared.set_init(InitState::Ready);
    tracing::log_worker_started(name);

    loop {
        let segments = {
            let (_order, mut pending) = shared.lock_pending();
            while pending.segments.is_empty() && !pending.shutdown {
                shared.work_cond.wait(&mut pending);
            }
            if pending.segments.is_empty() {
                pending.new_tasks_allowed = false;
                pending.worker_alive = false;
                shared.running.store(false, Ordering::Release);
                break;
            }
            std::mem::take(&mut pending.segments)
        };

        for Segment { tasks, epoch } in segments {
            drain(shared, tasks, epoch);
        }
    }

    shared.set_init(InitState::Idle);
    tracing::log_worker_stopped(name);
}

fn drain(shared: &Shared, tasks: FinalizerQueue, epoch: Epoch) {
    let count = tasks.len();
    if count > 0 {
        let started = Instant::now();
        {
            let _span = tracing::trace_drain("thread", epoch, count);
            tasks.finalize();
        }
        shared.metrics.record_busy(started.elapsed());
        shared.metrics.record_batch(count);
        tracing::log_batch_drained("thread", epoch, count);
    }
    shared.complete(epoch);
}
