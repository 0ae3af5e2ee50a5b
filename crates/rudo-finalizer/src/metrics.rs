//! Finalizer processor metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Point-in-time copy of a processor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Finalizer tasks executed.
    pub tasks_run: usize,
    /// Batches drained to completion.
    pub batches_drained: usize,
    /// Completion callbacks fired (one per epoch handed over).
    pub epochs_completed: usize,
    /// Times the background worker thread was spawned.
    pub worker_starts: usize,
    /// Run-loop turns that ran at least one group of tasks.
    pub loop_turns: usize,
    /// Run-loop turns deferred because they came too soon after the last one.
    pub throttled_turns: usize,
    /// Run-loop turns that stopped because the time budget ran out.
    pub deadline_exceeded_turns: usize,
    /// Total time spent running finalizers.
    pub busy_time: Duration,
}

/// Atomic counters shared between a processor and its drain thread.
///
/// All updates use relaxed ordering: the values are informational and are
/// never used to synchronize.
///
/// # Example
///
/// ```
/// use rudo_finalizer::metrics::ProcessorMetrics;
///
/// let metrics = ProcessorMetrics::new();
/// metrics.record_batch(3);
/// assert_eq!(metrics.snapshot().tasks_run, 3);
/// ```
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    tasks_run: AtomicUsize,
    batches_drained: AtomicUsize,
    epochs_completed: AtomicUsize,
    worker_starts: AtomicUsize,
    loop_turns: AtomicUsize,
    throttled_turns: AtomicUsize,
    deadline_exceeded_turns: AtomicUsize,
    busy_ns: AtomicU64,
}

impl ProcessorMetrics {
    /// Creates a metrics block with every counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tasks_run: AtomicUsize::new(0),
            batches_drained: AtomicUsize::new(0),
            epochs_completed: AtomicUsize::new(0),
            worker_starts: AtomicUsize::new(0),
            loop_turns: AtomicUsize::new(0),
            throttled_turns: AtomicUsize::new(0),
            deadline_exceeded_turns: AtomicUsize::new(0),
            busy_ns: AtomicU64::new(0),
        }
    }

    /// Records a fully drained batch of `tasks` finalizers.
    #[inline]
    pub fn record_batch(&self, tasks: usize) {
        self.tasks_run.fetch_add(tasks, Ordering::Relaxed);
        self.batches_drained.fetch_add(1, Ordering::Relaxed);
    }

    /// Records finalizers run without completing a batch.
    #[inline]
    pub fn record_tasks(&self, tasks: usize) {
        self.tasks_run.fetch_add(tasks, Ordering::Relaxed);
    }

    /// Records a completed batch whose tasks were already counted.
    #[inline]
    pub fn record_batch_drained(&self) {
        self.batches_drained.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completion callback.
    #[inline]
    pub fn record_epoch_completed(&self) {
        self.epochs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a worker thread spawn.
    #[inline]
    pub fn record_worker_start(&self) {
        self.worker_starts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a run-loop turn that did work.
    #[inline]
    pub fn record_turn(&self) {
        self.loop_turns.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a run-loop turn deferred by the spacing rule.
    #[inline]
    pub fn record_throttled_turn(&self) {
        self.throttled_turns.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a run-loop turn cut short by its time budget.
    #[inline]
    pub fn record_deadline_exceeded(&self) {
        self.deadline_exceeded_turns.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `elapsed` to the time spent running finalizers.
    #[inline]
    pub fn record_busy(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.busy_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            batches_drained: self.batches_drained.load(Ordering::Relaxed),
            epochs_completed: self.epochs_completed.load(Ordering::Relaxed),
            worker_starts: self.worker_starts.load(Ordering::Relaxed),
            loop_turns: self.loop_turns.load(Ordering::Relaxed),
            throttled_turns: self.throttled_turns.load(Ordering::Relaxed),
            deadline_exceeded_turns: self.deadline_exceeded_turns.load(Ordering::Relaxed),
            busy_time: Duration::from_nanos(self.busy_ns.load(Ordering::Relaxed)),
        }
    }
}
