//! Finalizer tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! events and spans for the worker thread lifecycle, batch drains and
//! run-loop turns. Without the feature every helper is an empty inline
//! function so call sites need no `cfg` of their own.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::time::Duration;
    use tracing::{span, Level};

    use crate::state::Epoch;

    /// Create a span covering the drain of one epoch's batch.
    pub fn trace_drain(processor: &'static str, epoch: Epoch, tasks: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "finalizer_drain",
            processor = processor,
            epoch = epoch.0,
            tasks = tasks
        )
        .entered()
    }

    /// Log the background worker coming up.
    pub fn log_worker_started(thread_name: &str) {
        tracing::debug!(thread_name, "finalizer_worker_started");
    }

    /// Log the background worker exiting after shutdown.
    pub fn log_worker_stopped(thread_name: &str) {
        tracing::debug!(thread_name, "finalizer_worker_stopped");
    }

    /// Log a batch that has been fully drained.
    pub fn log_batch_drained(processor: &'static str, epoch: Epoch, tasks: usize) {
        tracing::debug!(processor, epoch = epoch.0, tasks, "batch_drained");
    }

    /// Log the idle fast path firing a completion without a worker.
    pub fn log_idle_completion(epoch: Epoch) {
        tracing::trace!(epoch = epoch.0, "idle_completion");
    }

    /// Log a run-loop turn deferred by the spacing rule.
    pub fn log_turn_throttled(remaining: Duration) {
        tracing::trace!(remaining = ?remaining, "turn_throttled");
    }

    /// Log a run-loop turn cut short by its time budget.
    pub fn log_turn_deadline(tasks_left: usize) {
        tracing::debug!(tasks_left, "turn_deadline_exceeded");
    }

    /// Log the main-thread processor becoming available.
    pub fn log_main_thread_available() {
        tracing::debug!("main_thread_processor_available");
    }

    /// Log a main-thread partition folded into the regular one.
    pub fn log_main_thread_merged(epoch: Epoch, tasks: usize) {
        tracing::trace!(epoch = epoch.0, tasks, "main_thread_merged_into_regular");
    }

    /// Log a panic escaping a finalizer on the worker thread.
    pub fn log_worker_panic() {
        tracing::error!("finalizer panicked on the worker thread, aborting");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use std::time::Duration;

    use crate::state::Epoch;

    /// Stub guard when tracing is disabled.
    #[derive(Debug)]
    pub struct NoSpan;

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn trace_drain(_processor: &'static str, _epoch: Epoch, _tasks: usize) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_worker_started(_thread_name: &str) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_worker_stopped(_thread_name: &str) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_batch_drained(_processor: &'static str, _epoch: Epoch, _tasks: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_idle_completion(_epoch: Epoch) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_turn_throttled(_remaining: Duration) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_turn_deadline(_tasks_left: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_main_thread_available() {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_main_thread_merged(_epoch: Epoch, _tasks: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_worker_panic() {}
}

pub use internal::*;
