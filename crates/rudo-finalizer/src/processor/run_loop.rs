//! Finalizer draining on a host cooperative event loop.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use super::{CompletionCallback, NoopPool, ResourcePool};
use crate::config::RunLoopConfig;
use crate::metrics::{ProcessorMetrics, ProcessorStats};
use crate::queue::FinalizerQueue;
use crate::run_loop::{self as host, RunLoop, SourceId, TimerId};
use crate::state::Epoch;
use crate::tracing;

struct Scheduled {
    tasks: FinalizerQueue,
    epoch: Epoch,
    total: usize,
}

struct Attachment {
    run_loop: Arc<dyn RunLoop>,
    source: SourceId,
    timer: TimerId,
}

#[derive(Default)]
struct DrainState {
    /// Partially drained batch, resumed before anything in the FIFO.
    current: Option<Scheduled>,
    last_turn_end: Option<Instant>,
}

struct Inner {
    config: Mutex<RunLoopConfig>,
    queue: SegQueue<Scheduled>,
    attachment: Mutex<Option<Attachment>>,
    drain: Mutex<DrainState>,
    pool: Mutex<Arc<dyn ResourcePool>>,
    on_finalized: CompletionCallback,
    metrics: ProcessorMetrics,
}

impl Inner {
    fn loop_handles(&self) -> Option<(Arc<dyn RunLoop>, SourceId, TimerId)> {
        self.attachment
            .lock()
            .as_ref()
            .map(|att| (Arc::clone(&att.run_loop), att.source, att.timer))
    }

    fn signal(&self) {
        if let Some((run_loop, source, _)) = self.loop_handles() {
            run_loop.signal(source);
        }
    }

    fn arm_timer(&self, after: Duration) {
        if let Some((run_loop, _, timer)) = self.loop_handles() {
            run_loop.arm_timer(timer, after);
        }
    }

    /// One loop turn. Runs on the loop thread from the source or timer callback.
    fn turn(&self) {
        let mut drain = self.drain.lock();
        if drain.current.is_none() && self.queue.is_empty() {
            return;
        }

        let config = *self.config.lock();
        let now = Instant::now();
        if let Some(end) = drain.last_turn_end {
            let since = now.saturating_duration_since(end);
            if since < config.min_time_between_tasks {
                let remaining = config.min_time_between_tasks - since;
                self.arm_timer(remaining);
                self.metrics.record_throttled_turn();
                tracing::log_turn_throttled(remaining);
                return;
            }
        }

        self.metrics.record_turn();
        // An unrepresentable deadline means the turn has no time budget.
        let deadline = now.checked_add(config.max_time_in_task);
        let pool = Arc::clone(&*self.pool.lock());

        loop {
            let Some(mut batch) = drain.current.take().or_else(|| self.queue.pop()) else {
                drain.last_turn_end = Some(Instant::now());
                return;
            };

            // Re-read so a reconfiguration lands between groups.
            let group = self.config.lock().effective_batch_size();
            let started = Instant::now();
            let mut ran = 0;
            {
                let _span = tracing::trace_drain("run_loop", batch.epoch, group);
                pool.scoped(&mut || ran = batch.tasks.run_front(group));
            }
            self.metrics.record_busy(started.elapsed());
            self.metrics.record_tasks(ran);

            if batch.tasks.is_empty() {
                self.metrics.record_batch_drained();
                tracing::log_batch_drained("run_loop", batch.epoch, batch.total);
                (self.on_finalized)(batch.epoch);
                self.metrics.record_epoch_completed();
                continue;
            }

            let tasks_left = batch.tasks.len();
            drain.current = Some(batch);
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                let spacing = self.config.lock().min_time_between_tasks;
                self.arm_timer(spacing);
                drain.last_turn_end = Some(Instant::now());
                self.metrics.record_deadline_exceeded();
                tracing::log_turn_deadline(tasks_left);
                return;
            }
        }
    }
}

/// Drains finalizer batches a few tasks at a time on a host event loop.
///
/// The processor owns no thread. Once attached with
/// [`attach_to_current_loop`](Self::attach_to_current_loop) it registers one
/// wake source and one timer with that loop, and every loop turn drains
/// groups of [`batch_size`](RunLoopConfig::batch_size) tasks until either
/// everything is done or [`max_time_in_task`](RunLoopConfig::max_time_in_task)
/// has passed. The next turn starts no sooner than
/// [`min_time_between_tasks`](RunLoopConfig::min_time_between_tasks) after
/// the previous one ended.
///
/// Batches drain in schedule order and are never interleaved. A batch cut
/// short by the time budget resumes first on the next turn.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rudo_finalizer::processor::RunLoopProcessor;
/// use rudo_finalizer::run_loop::{self, EventLoop};
/// use rudo_finalizer::{Epoch, FinalizerQueue};
///
/// let event_loop = EventLoop::new();
/// let done = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&done);
/// let processor = RunLoopProcessor::new(move |_epoch: Epoch| flag.store(true, Ordering::SeqCst));
///
/// let _current = run_loop::enter(event_loop.handle());
/// let _subscription = processor.attach_to_current_loop().unwrap();
///
/// let mut batch = FinalizerQueue::new();
/// batch.push_fn(|| {});
/// processor.schedule(batch, Epoch(1));
///
/// assert!(event_loop.run_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
/// ```
pub struct RunLoopProcessor {
    inner: Arc<Inner>,
}

impl RunLoopProcessor {
    /// Creates a detached processor with the default [`RunLoopConfig`].
    pub fn new<F>(on_finalized: F) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        Self::with_callback(Arc::new(on_finalized), RunLoopConfig::default())
    }

    /// Creates a detached processor from a shared callback and a config.
    #[must_use]
    pub fn with_callback(on_finalized: CompletionCallback, config: RunLoopConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                queue: SegQueue::new(),
                attachment: Mutex::new(None),
                drain: Mutex::new(DrainState::default()),
                pool: Mutex::new(Arc::new(NoopPool)),
                on_finalized,
                metrics: ProcessorMetrics::new(),
            }),
        }
    }

    /// Opens a scope of `pool` around every group of tasks.
    #[must_use]
    pub fn with_pool<P>(self, pool: P) -> Self
    where
        P: ResourcePool + 'static,
    {
        *self.inner.pool.lock() = Arc::new(pool);
        self
    }

    /// Queues `tasks` for `epoch` and wakes the attached loop.
    ///
    /// Empty batches are dropped without a completion report.
    pub fn schedule(&self, tasks: FinalizerQueue, epoch: Epoch) {
        if tasks.is_empty() {
            return;
        }
        let total = tasks.len();
        self.inner.queue.push(Scheduled {
            tasks,
            epoch,
            total,
        });
        self.inner.signal();
    }

    /// Binds the processor to the loop running on the calling thread.
    ///
    /// Returns `None` if no loop is current on this thread, or if the
    /// processor is already attached (release builds). Work scheduled
    /// before the attach starts draining right away. Dropping the returned
    /// [`Subscription`] detaches again; it must be dropped on this thread.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the processor is already attached.
    #[must_use = "the processor detaches when the subscription is dropped"]
    pub fn attach_to_current_loop(&self) -> Option<Subscription> {
        let run_loop = host::current()?;

        let mut slot = self.inner.attachment.lock();
        debug_assert!(
            slot.is_none(),
            "run-loop processor attached to two loops at once"
        );
        if slot.is_some() {
            return None;
        }

        let turn_on_signal = Arc::downgrade(&self.inner);
        let source = run_loop.add_source(Arc::new(move || {
            if let Some(inner) = turn_on_signal.upgrade() {
                inner.turn();
            }
        }));
        let turn_on_timer = Arc::downgrade(&self.inner);
        let timer = run_loop.add_timer(Arc::new(move || {
            if let Some(inner) = turn_on_timer.upgrade() {
                inner.turn();
            }
        }));
        *slot = Some(Attachment {
            run_loop: Arc::clone(&run_loop),
            source,
            timer,
        });
        drop(slot);
        run_loop.signal(source);

        Some(Subscription {
            inner: Arc::downgrade(&self.inner),
            run_loop,
            source,
            timer,
            _not_send: PhantomData,
        })
    }

    /// Whether a loop is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.attachment.lock().is_some()
    }

    /// Applies `mutator` to the pacing configuration.
    ///
    /// A turn in progress picks up the new group size at its next group and
    /// the other values on the next turn.
    pub fn with_config<F>(&self, mutator: F)
    where
        F: FnOnce(&mut RunLoopConfig),
    {
        mutator(&mut *self.inner.config.lock());
    }

    /// Current pacing configuration.
    #[must_use]
    pub fn config(&self) -> RunLoopConfig {
        *self.inner.config.lock()
    }

    /// Snapshot of this processor's counters.
    #[must_use]
    pub fn metrics(&self) -> ProcessorStats {
        self.inner.metrics.snapshot()
    }
}

impl fmt::Debug for RunLoopProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopProcessor")
            .field("config", &self.config())
            .field("attached", &self.is_attached())
            .field("queued", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

/// Attachment of a [`RunLoopProcessor`] to one loop.
///
/// Dropping it unregisters the processor's source and timer and clears the
/// processor's attachment. Not `Send`: it is released on the thread that
/// attached.
#[must_use = "the processor detaches when the subscription is dropped"]
pub struct Subscription {
    inner: Weak<Inner>,
    run_loop: Arc<dyn RunLoop>,
    source: SourceId,
    timer: TimerId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_loop.remove_source(self.source);
        self.run_loop.remove_timer(self.timer);
        if let Some(inner) = self.inner.upgrade() {
            let mut slot = inner.attachment.lock();
            if slot.as_ref().is_some_and(|att| att.source == self.source) {
                *slot = None;
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("source", &self.source)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::RunLoopProcessor;
    use crate::queue::FinalizerQueue;
    use crate::run_loop::{self, EventLoop};
    use crate::state::Epoch;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_attach_needs_current_loop() {
        let processor = RunLoopProcessor::new(|_| {});
        assert!(processor.attach_to_current_loop().is_none());
        assert!(!processor.is_attached());
    }

    #[test]
    fn test_subscription_drop_detaches() {
        let event_loop = EventLoop::new();
        let processor = RunLoopProcessor::new(|_| {});
        let _current = run_loop::enter(event_loop.handle());
        let subscription = processor.attach_to_current_loop().unwrap();
        assert!(processor.is_attached());
        drop(subscription);
        assert!(!processor.is_attached());
    }

    #[test]
    fn test_empty_batch_is_ignored() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = RunLoopProcessor::new(move |epoch| sink.lock().push(epoch));
        let event_loop = EventLoop::new();
        let _current = run_loop::enter(event_loop.handle());
        let _subscription = processor.attach_to_current_loop().unwrap();

        processor.schedule(FinalizerQueue::new(), Epoch(1));
        event_loop.run_for(Duration::from_millis(20));
        assert!(seen.lock().is_empty());
        assert_eq!(processor.metrics().loop_turns, 0);
    }

    #[test]
    fn test_work_scheduled_before_attach_drains() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = RunLoopProcessor::new(move |epoch| sink.lock().push(epoch));
        let mut batch = FinalizerQueue::new();
        batch.push_fn(|| {});
        processor.schedule(batch, Epoch(4));

        let event_loop = EventLoop::new();
        let _current = run_loop::enter(event_loop.handle());
        let _subscription = processor.attach_to_current_loop().unwrap();
        assert!(event_loop.run_until(Duration::from_secs(5), || !seen.lock().is_empty()));
        assert_eq!(*seen.lock(), vec![Epoch(4)]);
    }

    #[test]
    fn test_with_config_applies() {
        let processor = RunLoopProcessor::new(|_| {});
        processor.with_config(|config| config.batch_size = 7);
        assert_eq!(processor.config().batch_size, 7);
    }

    #[test]
    fn test_unbounded_pacing_drains_without_overflow() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = RunLoopProcessor::new(move |epoch| sink.lock().push(epoch));
        processor.with_config(|config| {
            config.max_time_in_task = Duration::MAX;
            config.min_time_between_tasks = Duration::MAX;
            config.batch_size = 1;
        });
        for epoch in 1..=2 {
            let mut batch = FinalizerQueue::new();
            batch.push_fn(|| {});
            batch.push_fn(|| {});
            processor.schedule(batch, Epoch(epoch));
        }

        let event_loop = EventLoop::new();
        let _current = run_loop::enter(event_loop.handle());
        let _subscription = processor.attach_to_current_loop().unwrap();
        assert!(event_loop.run_until(Duration::from_secs(5), || seen.lock().len() == 2));
        assert_eq!(processor.metrics().deadline_exceeded_turns, 0);
        assert_eq!(processor.metrics().loop_turns, 1);
    }

    #[test]
    fn test_overrun_with_unbounded_spacing_parks_the_batch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = RunLoopProcessor::new(move |epoch| sink.lock().push(epoch));
        processor.with_config(|config| {
            config.max_time_in_task = Duration::ZERO;
            config.min_time_between_tasks = Duration::MAX;
            config.batch_size = 1;
        });
        let mut batch = FinalizerQueue::new();
        batch.push_fn(|| std::thread::sleep(Duration::from_millis(1)));
        batch.push_fn(|| {});
        processor.schedule(batch, Epoch(1));

        let event_loop = EventLoop::new();
        let _current = run_loop::enter(event_loop.handle());
        let _subscription = processor.attach_to_current_loop().unwrap();
        event_loop.run_for(Duration::from_millis(20));

        let stats = processor.metrics();
        assert_eq!(stats.tasks_run, 1);
        assert_eq!(stats.deadline_exceeded_turns, 1);
        assert!(seen.lock().is_empty());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_second_attach_registers_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let processor = RunLoopProcessor::new(move |epoch| sink.lock().push(epoch));
        let event_loop = EventLoop::new();
        let _current = run_loop::enter(event_loop.handle());
        let _first = processor.attach_to_current_loop().unwrap();
        assert!(processor.attach_to_current_loop().is_none());
        assert!(processor.is_attached());

        let mut batch = FinalizerQueue::new();
        batch.push_fn(|| {});
        processor.schedule(batch, Epoch(1));
        assert!(event_loop.run_until(Duration::from_secs(5), || !seen.lock().is_empty()));
        assert_eq!(processor.metrics().loop_turns, 1);
    }
}
