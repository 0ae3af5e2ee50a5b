//! Tunables for finalizer dispatch.

use std::time::Duration;

/// Default upper bound on time spent draining during one run-loop turn.
pub const DEFAULT_MAX_TIME_IN_TASK: Duration = Duration::from_millis(5);
/// Default minimum spacing between two run-loop turns.
pub const DEFAULT_MIN_TIME_BETWEEN_TASKS: Duration = Duration::from_millis(10);
/// Default number of finalizers run between two deadline checks.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default name of the background finalizer thread.
pub const DEFAULT_WORKER_THREAD_NAME: &str = "rudo-finalizer";

/// Pacing of a [`RunLoopProcessor`](crate::processor::RunLoopProcessor).
///
/// A turn stops draining once `max_time_in_task` has elapsed, but only at a
/// group boundary: a single slow finalizer is never interrupted, so the real
/// overshoot is `max_time_in_task` plus the duration of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLoopConfig {
    /// Time budget for one loop turn.
    pub max_time_in_task: Duration,
    /// Minimum idle time between the end of one turn and the next.
    pub min_time_between_tasks: Duration,
    /// Tasks run per resource-pool scope, and between deadline checks.
    pub batch_size: usize,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            max_time_in_task: DEFAULT_MAX_TIME_IN_TASK,
            min_time_between_tasks: DEFAULT_MIN_TIME_BETWEEN_TASKS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RunLoopConfig {
    /// Group size used by the drain loop; a zero `batch_size` still makes progress.
    #[must_use]
    pub const fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        }
    }
}

/// Which drain strategy runs the regular finalizer partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    /// A dedicated background thread drains regular finalizers.
    #[default]
    ThreadBacked,
    /// Regular finalizers are drained by a run loop the embedder drives.
    LoopBacked,
}

/// Configuration of a [`Finalizers`](crate::Finalizers) dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerConfig {
    /// Name given to the background finalizer thread.
    pub worker_thread_name: String,
    /// Stack size of the background finalizer thread; `None` keeps the
    /// platform default.
    pub worker_stack_size: Option<usize>,
    /// Drain strategy for the regular partition.
    pub strategy: StrategyKind,
    /// Pacing of the main-thread run-loop processor.
    pub main_thread: RunLoopConfig,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME.to_owned(),
            worker_stack_size: None,
            strategy: StrategyKind::default(),
            main_thread: RunLoopConfig::default(),
        }
    }
}
