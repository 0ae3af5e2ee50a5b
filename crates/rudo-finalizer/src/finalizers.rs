//! Collector-facing entry point.

use std::sync::Arc;

use crate::config::{FinalizerConfig, RunLoopConfig};
use crate::error::Result;
use crate::processor::SegregatedFinalizerProcessor;
use crate::queue::SegregatedFinalizerQueue;
use crate::run_loop::HostLoopCell;
use crate::state::{Epoch, GcEpochState};

/// Everything a collector needs to hand finalizers off and wait for them.
///
/// Owns a [`SegregatedFinalizerProcessor`] whose two sides report through an
/// [`EpochJoin`](crate::completion::EpochJoin) into a shared
/// [`GcEpochState`], so [`wait_finalized`](Self::wait_finalized) returns only
/// once both partitions of the epoch have run.
///
/// # Example
///
/// ```
/// use rudo_finalizer::{Finalizers, SegregatedFinalizerQueue};
///
/// let finalizers = Finalizers::new(Default::default());
/// let state = finalizers.state();
///
/// let epoch = state.schedule();
/// state.start(epoch);
/// let mut batch = SegregatedFinalizerQueue::new();
/// batch.regular.push_fn(|| println!("closing a file"));
/// state.finish(epoch);
///
/// finalizers.schedule(batch, epoch).unwrap();
/// finalizers.wait_finalized(epoch);
/// finalizers.stop();
/// ```
#[derive(Debug)]
pub struct Finalizers {
    state: Arc<GcEpochState>,
    processor: SegregatedFinalizerProcessor,
}

impl Finalizers {
    /// Creates a dispatcher whose main-thread side follows [`HostLoopCell::main`].
    #[must_use]
    pub fn new(config: FinalizerConfig) -> Self {
        Self::with_host_loop(config, HostLoopCell::main())
    }

    /// Creates a dispatcher whose main-thread side follows `host`.
    #[must_use]
    pub fn with_host_loop(config: FinalizerConfig, host: &HostLoopCell) -> Self {
        Self::with_state(Arc::new(GcEpochState::new()), config, host)
    }

    /// Creates a dispatcher reporting into an existing epoch state.
    #[must_use]
    pub fn with_state(
        state: Arc<GcEpochState>,
        config: FinalizerConfig,
        host: &HostLoopCell,
    ) -> Self {
        let processor = SegregatedFinalizerProcessor::joined(Arc::clone(&state), &config, host);
        Self { state, processor }
    }

    /// Hands the finalizers found by the collection of `epoch` over.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// background thread was needed and could not be created.
    pub fn schedule(&self, batch: SegregatedFinalizerQueue, epoch: Epoch) -> Result<()> {
        self.processor.schedule(batch, epoch)
    }

    /// Brings the background thread up ahead of the first batch.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// thread could not be created.
    pub fn start(&self) -> Result<()> {
        self.processor.start_thread_if_needed()
    }

    /// Drains and joins the background thread.
    ///
    /// The epoch state stays usable; call [`GcEpochState::shutdown`] on
    /// [`state`](Self::state) to release waiters for good.
    pub fn stop(&self) {
        self.processor.stop_thread();
    }

    /// Blocks until every finalizer of `epoch` has run, or the state is shut down.
    pub fn wait_finalized(&self, epoch: Epoch) {
        self.state.wait_epoch_finalized(epoch);
    }

    /// Applies `mutator` to the main-thread pacing.
    pub fn configure_main_thread<F>(&self, mutator: F)
    where
        F: FnOnce(&mut RunLoopConfig),
    {
        self.processor.configure_main_thread(mutator);
    }

    /// Whether main-thread finalizers currently run on the main thread.
    #[must_use]
    pub fn main_thread_available(&self) -> bool {
        self.processor.main_thread_available()
    }

    /// Whether the background thread is alive.
    #[must_use]
    pub fn is_thread_running(&self) -> bool {
        self.processor.is_thread_running()
    }

    /// The shared epoch state.
    #[must_use]
    pub fn state(&self) -> Arc<GcEpochState> {
        Arc::clone(&self.state)
    }

    /// The underlying dispatcher.
    #[must_use]
    pub const fn processor(&self) -> &SegregatedFinalizerProcessor {
        &self.processor
    }
}
