//! Finalizer dispatch for a tracing garbage collector.
//!
//! `rudo-finalizer` takes the finalizers a collection cycle found to be due
//! and runs them off the collector's critical path, in epoch order, either
//! on a dedicated background thread or on a host cooperative event loop.
//!
//! # Features
//!
//! - **Epoch tracking**: [`GcEpochState`] records when each cycle was
//!   scheduled, started, finished and finalized, and lets callers block on
//!   any of those transitions
//! - **Background draining**: [`FinalizerProcessor`] owns one lazily started
//!   worker thread and reports every epoch once its batch has run
//! - **Run-loop draining**: [`RunLoopProcessor`](processor::RunLoopProcessor)
//!   drains a few finalizers per loop turn within a time budget
//! - **Main-thread finalizers**: [`SegregatedFinalizerProcessor`] sends
//!   main-thread finalizers to the main thread's loop when it runs, and to
//!   the background thread otherwise
//!
//! # Quick Start
//!
//! ```
//! use rudo_finalizer::{FinalizerConfig, Finalizers, SegregatedFinalizerQueue};
//!
//! let finalizers = Finalizers::new(FinalizerConfig::default());
//! let state = finalizers.state();
//!
//! // One collection cycle.
//! let epoch = state.schedule();
//! state.start(epoch);
//! let mut batch = SegregatedFinalizerQueue::new();
//! batch.regular.push_fn(|| println!("finalizer ran"));
//! state.finish(epoch);
//!
//! finalizers.schedule(batch, epoch).unwrap();
//! finalizers.wait_finalized(epoch);
//!
//! finalizers.stop();
//! ```
//!
//! # Main-thread loop
//!
//! The thread that owns the host's main loop publishes it once the loop is
//! running. From then on main-thread finalizers run there:
//!
//! ```no_run
//! use rudo_finalizer::run_loop::{EventLoop, HostLoopCell};
//!
//! let event_loop = EventLoop::new();
//! HostLoopCell::main().publish(event_loop.handle());
//! event_loop.run();
//! ```
//!
//! # Feature flags
//!
//! - `tracing`: structured events and spans for worker lifecycle, batch
//!   drains and run-loop turns
//! - `tokio`: [`TokioRunLoop`](run_loop::TokioRunLoop), a run loop backed by
//!   a current-thread tokio runtime

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod completion;
pub mod config;
pub mod error;
mod finalizers;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod run_loop;
pub mod state;
pub mod sync;
mod tracing;

// Re-export public API
pub use config::{FinalizerConfig, RunLoopConfig, StrategyKind};
pub use error::{FinalizerError, Result};
pub use finalizers::Finalizers;
pub use metrics::{ProcessorMetrics, ProcessorStats};
pub use processor::{
    CompletionCallback, FinalizerProcessor, MainThreadProcessor, ProcessingStrategy,
    SegregatedFinalizerProcessor,
};
pub use queue::{FinalizerQueue, FinalizerTask, SegregatedFinalizerQueue};
pub use state::{Epoch, GcEpochState};
