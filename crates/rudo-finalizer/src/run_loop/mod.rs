//! Host cooperative event loop integration.
//!
//! Finalizers that must run on a particular host thread are drained by a
//! loop that thread already drives. This module defines the small surface
//! the processors need from such a loop:
//!
//! - [`RunLoop::post`]: run a one-shot callback on the loop thread
//! - a wake *source*: a callback the loop runs after someone calls
//!   [`RunLoop::signal`] (signals arriving before the callback runs coalesce)
//! - a deferred *timer*: a callback the loop runs once its deadline passes,
//!   re-armed with [`RunLoop::arm_timer`]
//!
//! Two implementations ship with the crate: [`EventLoop`], a self-contained
//! single-threaded loop, and [`TokioRunLoop`] (feature `tokio`), which runs
//! sources and timers as tasks of a current-thread tokio runtime.
//!
//! A loop publishes itself as the [`current`] loop of its thread while it
//! runs, which is what
//! [`RunLoopProcessor::attach_to_current_loop`](crate::processor::RunLoopProcessor::attach_to_current_loop)
//! binds to. A loop owned by a *designated* thread (usually the main thread)
//! can additionally be announced to other threads through a [`HostLoopCell`].

mod event_loop;
#[cfg(feature = "tokio")]
mod tokio_loop;

pub use event_loop::EventLoop;
#[cfg(feature = "tokio")]
pub use tokio_loop::TokioRunLoop;

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;

/// Callback registered as a loop source or timer.
pub type LoopCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// One-shot callback posted to a loop.
pub type PostedTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle of a wake source registered with a [`RunLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// Handle of a deferred timer registered with a [`RunLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Thread-safe handle to a cooperative event loop.
///
/// Every method may be called from any thread; callbacks always run on the
/// thread driving the loop, one at a time.
pub trait RunLoop: Send + Sync {
    /// Runs `task` once on the loop thread.
    fn post(&self, task: PostedTask);

    /// Registers a wake source. `callback` runs after [`signal`](Self::signal).
    fn add_source(&self, callback: LoopCallback) -> SourceId;

    /// Marks `source` pending and wakes the loop.
    ///
    /// Signalling an unknown or removed source does nothing.
    fn signal(&self, source: SourceId);

    /// Unregisters `source`. A signal already in flight may be dropped.
    fn remove_source(&self, source: SourceId);

    /// Registers a disarmed timer.
    fn add_timer(&self, callback: LoopCallback) -> TimerId;

    /// (Re-)arms `timer` to fire once, `after` from now.
    ///
    /// Arming an armed timer replaces its deadline.
    fn arm_timer(&self, timer: TimerId, after: Duration);

    /// Unregisters `timer`.
    fn remove_timer(&self, timer: TimerId);
}

thread_local! {
    static CURRENT: RefCell<Vec<Arc<dyn RunLoop>>> = const { RefCell::new(Vec::new()) };
}

/// Returns the loop currently running on this thread, if any.
#[must_use]
pub fn current() -> Option<Arc<dyn RunLoop>> {
    CURRENT
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten()
}

/// Publishes `run_loop` as this thread's [`current`] loop until the guard drops.
///
/// Loop implementations call this around their dispatch; nesting is allowed
/// and the innermost loop wins.
pub fn enter(run_loop: Arc<dyn RunLoop>) -> CurrentLoopGuard {
    CURRENT.with(|stack| stack.borrow_mut().push(run_loop));
    CurrentLoopGuard {
        _not_send: PhantomData,
    }
}

/// Scope during which a loop is the current loop of this thread.
#[must_use = "the loop stops being current when the guard is dropped"]
pub struct CurrentLoopGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl fmt::Debug for CurrentLoopGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentLoopGuard").finish_non_exhaustive()
    }
}

type Waiter = Box<dyn FnOnce(&Arc<dyn RunLoop>) + Send + 'static>;

#[derive(Default)]
struct CellState {
    run_loop: Option<Arc<dyn RunLoop>>,
    waiters: Vec<Waiter>,
}

/// One-shot announcement of a designated thread's loop.
///
/// The thread that owns the loop calls [`publish`](Self::publish) once its
/// loop is up; code on other threads either reads it with
/// [`get`](Self::get) or registers interest with
/// [`when_published`](Self::when_published), which runs immediately if the
/// loop is already known.
///
/// # Example
///
/// ```
/// use rudo_finalizer::run_loop::{EventLoop, HostLoopCell};
///
/// let cell = HostLoopCell::new();
/// let event_loop = EventLoop::new();
/// cell.publish(event_loop.handle());
/// assert!(cell.get().is_some());
/// ```
#[derive(Default)]
pub struct HostLoopCell {
    state: Mutex<CellState>,
}

impl HostLoopCell {
    /// Creates an unresolved cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cell for the host's main thread loop.
    #[must_use]
    pub fn main() -> &'static Self {
        static MAIN: LazyLock<HostLoopCell> = LazyLock::new(HostLoopCell::new);
        &MAIN
    }

    /// Resolves the cell and runs every pending [`when_published`](Self::when_published) callback.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the cell was already resolved.
    pub fn publish(&self, run_loop: Arc<dyn RunLoop>) {
        let waiters = {
            let mut state = self.state.lock();
            debug_assert!(state.run_loop.is_none(), "host loop published twice");
            state.run_loop = Some(Arc::clone(&run_loop));
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(&run_loop);
        }
    }

    /// The published loop, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn RunLoop>> {
        self.state.lock().run_loop.clone()
    }

    /// Whether the cell has been resolved.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.state.lock().run_loop.is_some()
    }

    /// Runs `callback` with the loop once it is published.
    ///
    /// Runs on the calling thread right away if the loop is already known,
    /// otherwise on the thread that later calls [`publish`](Self::publish).
    pub fn when_published<F>(&self, callback: F)
    where
        F: FnOnce(&Arc<dyn RunLoop>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(run_loop) = state.run_loop.clone() {
            drop(state);
            callback(&run_loop);
        } else {
            state.waiters.push(Box::new(callback));
        }
    }
}

impl fmt::Debug for HostLoopCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HostLoopCell")
            .field("published", &state.run_loop.is_some())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{current, enter, EventLoop, HostLoopCell};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_current_is_scoped() {
        assert!(current().is_none());
        let event_loop = EventLoop::new();
        {
            let _guard = enter(event_loop.handle());
            assert!(current().is_some());
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_when_published_before_and_after() {
        let cell = HostLoopCell::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let early = Arc::clone(&calls);
        cell.when_published(move |_| {
            early.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let event_loop = EventLoop::new();
        cell.publish(event_loop.handle());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&calls);
        cell.when_published(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cell.is_published());
    }
}
