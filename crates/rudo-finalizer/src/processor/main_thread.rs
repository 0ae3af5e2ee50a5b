//! Run-loop processor bound to the host's main thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{CompletionCallback, RunLoopProcessor, Subscription};
use crate::config::RunLoopConfig;
use crate::metrics::ProcessorStats;
use crate::queue::FinalizerQueue;
use crate::run_loop::{HostLoopCell, RunLoop};
use crate::state::Epoch;
use crate::tracing;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Subscriptions live on the loop thread that created them.
    static SUBSCRIPTIONS: RefCell<HashMap<u64, Subscription>> = RefCell::new(HashMap::new());
}

/// A [`RunLoopProcessor`] that only accepts work once it is attached to a
/// designated host thread's loop.
///
/// Construction registers interest in a [`HostLoopCell`]. Once the owning
/// thread publishes its loop, an attach request is posted to that loop and
/// runs there; only then does [`available`](Self::available) turn true. If
/// the loop is never published the processor stays unavailable, and callers
/// must route main-thread work elsewhere.
///
/// Dropping the processor posts a detach request to the same loop.
pub struct MainThreadProcessor {
    id: u64,
    processor: Arc<RunLoopProcessor>,
    available: Arc<AtomicBool>,
    host: Arc<Mutex<Option<Arc<dyn RunLoop>>>>,
}

impl MainThreadProcessor {
    /// Creates a processor that attaches to the loop published in `cell`.
    #[must_use]
    pub fn new(
        cell: &HostLoopCell,
        on_finalized: CompletionCallback,
        config: RunLoopConfig,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let processor = Arc::new(RunLoopProcessor::with_callback(on_finalized, config));
        let available = Arc::new(AtomicBool::new(false));
        let host = Arc::new(Mutex::new(None));

        let target = Arc::downgrade(&processor);
        let flag = Arc::clone(&available);
        let slot = Arc::clone(&host);
        cell.when_published(move |run_loop: &Arc<dyn RunLoop>| {
            *slot.lock() = Some(Arc::clone(run_loop));
            run_loop.post(Box::new(move || attach(id, &target, &flag)));
        });

        Self {
            id,
            processor,
            available,
            host,
        }
    }

    /// Creates a processor bound to the process-wide [`HostLoopCell::main`].
    #[must_use]
    pub fn for_main_thread(on_finalized: CompletionCallback, config: RunLoopConfig) -> Self {
        Self::new(HostLoopCell::main(), on_finalized, config)
    }

    /// Whether the processor is attached to the main thread's loop.
    #[must_use]
    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Queues `tasks` for `epoch` on the main thread's loop.
    ///
    /// Empty batches are ignored.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the batch is non-empty and the processor
    /// is not [`available`](Self::available).
    pub fn schedule(&self, tasks: FinalizerQueue, epoch: Epoch) {
        if tasks.is_empty() {
            return;
        }
        debug_assert!(
            self.available(),
            "main-thread finalizers for {epoch} scheduled before the main-thread loop is available"
        );
        self.processor.schedule(tasks, epoch);
    }

    /// Forwards to [`RunLoopProcessor::with_config`].
    pub fn with_config<F>(&self, mutator: F)
    where
        F: FnOnce(&mut RunLoopConfig),
    {
        self.processor.with_config(mutator);
    }

    /// Current pacing configuration.
    #[must_use]
    pub fn config(&self) -> RunLoopConfig {
        self.processor.config()
    }

    /// Snapshot of the wrapped processor's counters.
    #[must_use]
    pub fn metrics(&self) -> ProcessorStats {
        self.processor.metrics()
    }
}

fn attach(id: u64, target: &Weak<RunLoopProcessor>, available: &AtomicBool) {
    let Some(processor) = target.upgrade() else {
        return;
    };
    let Some(subscription) = processor.attach_to_current_loop() else {
        return;
    };
    let replaced = SUBSCRIPTIONS.with(|subs| subs.borrow_mut().insert(id, subscription));
    drop(replaced);
    available.store(true, Ordering::Release);
    tracing::log_main_thread_available();
}

fn detach(id: u64) {
    let removed = SUBSCRIPTIONS
        .try_with(|subs| subs.borrow_mut().remove(&id))
        .ok()
        .flatten();
    drop(removed);
}

impl Drop for MainThreadProcessor {
    fn drop(&mut self) {
        self.available.store(false, Ordering::Release);
        let id = self.id;
        if let Some(run_loop) = self.host.lock().take() {
            run_loop.post(Box::new(move || detach(id)));
        }
    }
}

impl fmt::Debug for MainThreadProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadProcessor")
            .field("available", &self.available())
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}
