//! Drain strategy for the regular finalizer partition.

use super::{CompletionCallback, FinalizerProcessor, RunLoopProcessor};
use crate::config::{FinalizerConfig, StrategyKind};
use crate::error::Result;
use crate::metrics::ProcessorStats;
use crate::queue::FinalizerQueue;
use crate::state::Epoch;

/// The processor draining regular finalizers, chosen once from
/// [`FinalizerConfig::strategy`].
#[derive(Debug)]
pub enum ProcessingStrategy {
    /// A dedicated background thread.
    ThreadBacked(FinalizerProcessor),
    /// A run loop the embedder attaches with
    /// [`RunLoopProcessor::attach_to_current_loop`].
    LoopBacked(RunLoopProcessor),
}

impl ProcessingStrategy {
    /// Builds the strategy selected by `config`.
    #[must_use]
    pub fn new(on_finalized: CompletionCallback, config: &FinalizerConfig) -> Self {
        match config.strategy {
            StrategyKind::ThreadBacked => {
                let mut processor = FinalizerProcessor::with_callback(on_finalized)
                    .with_thread_name(config.worker_thread_name.clone());
                if let Some(size) = config.worker_stack_size {
                    processor = processor.with_stack_size(size);
                }
                Self::ThreadBacked(processor)
            }
            StrategyKind::LoopBacked => Self::LoopBacked(RunLoopProcessor::with_callback(
                on_finalized,
                config.main_thread,
            )),
        }
    }

    /// Which variant this is.
    #[must_use]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::ThreadBacked(_) => StrategyKind::ThreadBacked,
            Self::LoopBacked(_) => StrategyKind::LoopBacked,
        }
    }

    /// Hands `tasks` over for `epoch`.
    ///
    /// The thread-backed strategy reports every epoch, empty or not. The
    /// loop-backed strategy drops empty batches without a report.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if a
    /// background thread was needed and could not be created.
    pub fn schedule(&self, tasks: FinalizerQueue, epoch: Epoch) -> Result<()> {
        match self {
            Self::ThreadBacked(processor) => processor.schedule_tasks(tasks, epoch),
            Self::LoopBacked(processor) => {
                processor.schedule(tasks, epoch);
                Ok(())
            }
        }
    }

    /// Starts the background thread and waits for it to initialize.
    /// Nothing to do for the loop-backed strategy.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizerError::Spawn`](crate::FinalizerError::Spawn) if the
    /// thread could not be created.
    pub fn start_thread_if_needed(&self) -> Result<()> {
        if let Self::ThreadBacked(processor) = self {
            processor.start_thread_if_none_running()?;
            processor.wait_thread_initialized();
        }
        Ok(())
    }

    /// Stops the background thread, if any.
    pub fn stop_thread(&self) {
        if let Self::ThreadBacked(processor) = self {
            processor.stop_thread();
        }
    }

    /// Whether a background thread is alive. Always false when loop-backed.
    #[must_use]
    pub fn is_thread_running(&self) -> bool {
        match self {
            Self::ThreadBacked(processor) => processor.is_thread_running(),
            Self::LoopBacked(_) => false,
        }
    }

    /// The run-loop processor, for the embedder to attach.
    #[must_use]
    pub const fn as_run_loop(&self) -> Option<&RunLoopProcessor> {
        match self {
            Self::LoopBacked(processor) => Some(processor),
            Self::ThreadBacked(_) => None,
        }
    }

    /// Snapshot of the underlying processor's counters.
    #[must_use]
    pub fn metrics(&self) -> ProcessorStats {
        match self {
            Self::ThreadBacked(processor) => processor.metrics(),
            Self::LoopBacked(processor) => processor.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessingStrategy;
    use crate::config::{FinalizerConfig, StrategyKind};
    use crate::queue::FinalizerQueue;
    use crate::state::Epoch;
    use std::sync::Arc;

    #[test]
    fn test_kind_follows_config() {
        let threaded =
            ProcessingStrategy::new(Arc::new(|_: Epoch| {}), &FinalizerConfig::default());
        assert_eq!(threaded.kind(), StrategyKind::ThreadBacked);
        assert!(threaded.as_run_loop().is_none());

        let config = FinalizerConfig {
            strategy: StrategyKind::LoopBacked,
            ..FinalizerConfig::default()
        };
        let looped = ProcessingStrategy::new(Arc::new(|_: Epoch| {}), &config);
        assert_eq!(looped.kind(), StrategyKind::LoopBacked);
        assert!(looped.as_run_loop().is_some());
    }

    #[test]
    fn test_loop_backed_never_runs_a_thread() {
        let config = FinalizerConfig {
            strategy: StrategyKind::LoopBacked,
            ..FinalizerConfig::default()
        };
        let strategy = ProcessingStrategy::new(Arc::new(|_: Epoch| {}), &config);
        strategy.start_thread_if_needed().unwrap();
        let mut batch = FinalizerQueue::new();
        batch.push_fn(|| {});
        strategy.schedule(batch, Epoch(1)).unwrap();
        assert!(!strategy.is_thread_running());
        strategy.stop_thread();
    }

    #[test]
    fn test_thread_backed_start_and_stop() {
        let strategy =
            ProcessingStrategy::new(Arc::new(|_: Epoch| {}), &FinalizerConfig::default());
        strategy.start_thread_if_needed().unwrap();
        assert!(strategy.is_thread_running());
        strategy.stop_thread();
        assert!(!strategy.is_thread_running());
    }
}
