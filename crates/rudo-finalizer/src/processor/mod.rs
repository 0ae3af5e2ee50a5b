//! Finalizer processors.
//!
//! A processor takes ownership of finalizer batches and drains them in the
//! order they were scheduled, reporting each epoch through a completion
//! callback once its batch has run.
//!
//! - [`FinalizerProcessor`]: a lazily started background thread.
//! - [`RunLoopProcessor`]: drains on a host cooperative event loop, a few
//!   tasks per loop turn.
//! - [`MainThreadProcessor`]: a [`RunLoopProcessor`] bound to the main
//!   thread's loop once that loop is up.
//! - [`SegregatedFinalizerProcessor`]: routes the two partitions of a
//!   [`SegregatedFinalizerQueue`](crate::SegregatedFinalizerQueue) to a
//!   regular drain strategy and a main-thread processor.

mod main_thread;
mod run_loop;
mod segregated;
mod strategy;
mod thread;

pub use main_thread::MainThreadProcessor;
pub use run_loop::{RunLoopProcessor, Subscription};
pub use segregated::SegregatedFinalizerProcessor;
pub use strategy::ProcessingStrategy;
pub use thread::FinalizerProcessor;

use std::sync::Arc;

use crate::state::Epoch;

/// Called once per scheduled epoch after that epoch's batch has run.
///
/// Runs on whichever thread drained the batch, or synchronously on the
/// scheduling thread for the idle fast path. It must not call back into the
/// processor that invoked it.
pub type CompletionCallback = Arc<dyn Fn(Epoch) + Send + Sync + 'static>;

/// Scoped resource pool opened around each group of finalizers a
/// [`RunLoopProcessor`] runs.
///
/// Finalizers that call into a host runtime may leave transient objects in
/// an autorelease-style pool; opening one scope per group bounds how many
/// of them are alive at once without paying for a scope per task.
pub trait ResourcePool: Send + Sync {
    /// Runs `body` inside one pool scope.
    fn scoped(&self, body: &mut dyn FnMut());
}

/// A [`ResourcePool`] that opens no scope at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPool;

impl ResourcePool for NoopPool {
    #[inline]
    fn scoped(&self, body: &mut dyn FnMut()) {
        body();
    }
}
