//! Dispatcher for segregated finalizer batches.

use std::fmt;
use std::sync::Arc;

use super::{CompletionCallback, MainThreadProcessor, ProcessingStrategy};
use crate::completion::EpochJoin;
use crate::config::{FinalizerConfig, RunLoopConfig};
use crate::error::Result;
use crate::queue::SegregatedFinalizerQueue;
use crate::run_loop::HostLoopCell;
use crate::state::{Epoch, GcEpochState};
use crate::tracing;

/// Routes each partition of a [`SegregatedFinalizerQueue`] to its processor.
///
/// Regular finalizers go to the configured [`ProcessingStrategy`],
/// main-thread finalizers to a [`MainThreadProcessor`]. While the main-thread
/// processor is unavailable, main-thread finalizers are folded into the
/// regular partition so nothing waits on a loop that may never run.
///
/// The two sides report completion independently and without any ordering
/// between them.
pub struct SegregatedFinalizerProcessor {
    regular: ProcessingStrategy,
    main_thread: MainThreadProcessor,
    join: Option<Arc<EpochJoin>>,
}

impl SegregatedFinalizerProcessor {
    /// Creates a dispatcher whose two sides report to the same callback.
    #[must_use]
    pub fn new(
        on_finalized: CompletionCallback,
        config: &FinalizerConfig,
        host: &HostLoopCell,
    ) -> Self {
        Self::with_callbacks(Arc::clone(&on_finalized), on_finalized, config, host)
    }

    /// Creates a dispatcher with one callback per side.
    #[must_use]
    pub fn with_callbacks(
        regular: CompletionCallback,
        main_thread: CompletionCallback,
        config: &FinalizerConfig,
        host: &HostLoopCell,
    ) -> Self {
        Self {
            regular: ProcessingStrategy::new(regular, config),
            main_thread: MainThreadProcessor::new(host, main_thread, config.main_thread),
            join: None,
        }
    }

    /// Creates a dispatcher that records an epoch in `state` once both
    /// sides have drained it, through an [`EpochJoin`].
    #[must_use]
    pub fn joined(state: Arc<GcEpochState>, config: &FinalizerConfig, host: &HostLoopCell) -> Self {
        let join = EpochJoin::new(state);
        let regular = Arc::clone(&join);
        let main_thread = Arc::clone(&join);
        let mut dispatcher = Self::with_callbacks(
            Arc::new(move |epoch: Epoch| regular.regular_completed(epoch)),
            Arc::new(move |epoch: Epoch| main_thread.main_thread_completed(epoch)),
            config,
            host,
        );
        dispatcher.join = Some(join);
        dispatcher
    }

    /// Dispatches both partitions of `batch` for `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// regular side needed a background thread and could not create one.
    /// Both partitions stay queued: the main-thread side drains as usual and
    /// the regular side runs once a later start succeeds.
    pub fn schedule(&self, mut batch: SegregatedFinalizerQueue, epoch: Epoch) -> Result<()> {
        if !self.main_thread_available() && !batch.main_thread.is_empty() {
            tracing::log_main_thread_merged(epoch, batch.main_thread.len());
            batch.merge_into_regular();
        }
        let (regular, main_thread) = batch.into_parts();
        if let Some(join) = &self.join {
            join.register(epoch, !regular.is_empty(), !main_thread.is_empty());
        }
        // The main-thread side cannot fail, so it goes first and a spawn
        // error on the regular side leaves it queued.
        self.main_thread.schedule(main_thread, epoch);
        self.regular.schedule(regular, epoch)
    }

    /// Starts the regular side's background thread, if it uses one, and
    /// waits until it is initialized.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// thread could not be created.
    pub fn start_thread_if_needed(&self) -> Result<()> {
        self.regular.start_thread_if_needed()
    }

    /// Stops the regular side's background thread, if any.
    pub fn stop_thread(&self) {
        self.regular.stop_thread();
    }

    /// Whether the regular side's background thread is alive.
    #[must_use]
    pub fn is_thread_running(&self) -> bool {
        self.regular.is_thread_running()
    }

    /// Applies `mutator` to the main-thread processor's pacing.
    pub fn configure_main_thread<F>(&self, mutator: F)
    where
        F: FnOnce(&mut RunLoopConfig),
    {
        self.main_thread.with_config(mutator);
    }

    /// Whether main-thread finalizers currently run on the main thread.
    #[must_use]
    pub fn main_thread_available(&self) -> bool {
        self.main_thread.available()
    }

    /// The regular side.
    #[must_use]
    pub const fn regular(&self) -> &ProcessingStrategy {
        &self.regular
    }

    /// The main-thread side.
    #[must_use]
    pub const fn main_thread(&self) -> &MainThreadProcessor {
        &self.main_thread
    }
}

impl fmt::Debug for SegregatedFinalizerProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegregatedFinalizerProcessor")
            .field("regular", &self.regular)
            .field("main_thread", &self.main_thread)
            .field("joined", &self.join.is_some())
            .finish()
    }
}
