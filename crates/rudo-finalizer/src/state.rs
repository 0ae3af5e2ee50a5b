//! GC epoch state machine.
//!
//! Every collection cycle is identified by an [`Epoch`]. [`GcEpochState`]
//! tracks four high-water marks for those epochs:
//!
//! | Counter     | Written by             | Meaning                                  |
//! |-------------|------------------------|------------------------------------------|
//! | `scheduled` | `GcEpochState::schedule` | a collection has been requested        |
//! | `started`   | the collector          | marking for the epoch has begun          |
//! | `finished`  | the collector          | sweeping for the epoch is done           |
//! | `finalized` | finalizer processors   | every finalizer of the epoch has run     |
//!
//! In correct usage `finalized <= finished <= started <= scheduled`.
//!
//! Each counter has its own condition variable so that, for example, a
//! finalizer completing never wakes threads that only wait for a collection
//! to finish. All four share one mutex.

use std::fmt;

use parking_lot::{Condvar, Mutex};

/// Identifier of one GC cycle and of the finalizer batch it produced.
///
/// Epochs are handed out by [`GcEpochState::schedule`] and only ever grow.
/// `Epoch(0)` means "nothing has happened yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The epoch before any collection has been scheduled.
    pub const ZERO: Self = Self(0);

    /// Returns the epoch that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    finalized: Epoch,
    shutdown: bool,
}

/// Epoch counters with wait/notify semantics.
///
/// Owns no threads. Waiting operations block the calling thread on a
/// condition variable until the requested epoch is reached or
/// [`shutdown`](Self::shutdown) is called, whichever comes first. Callers
/// woken by shutdown must re-check whatever state they care about.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_finalizer::{Epoch, GcEpochState};
///
/// let state = Arc::new(GcEpochState::new());
/// let epoch = state.schedule();
/// assert_eq!(epoch, Epoch(1));
///
/// state.start(epoch);
/// state.finish(epoch);
///
/// let finalizer_side = Arc::clone(&state);
/// std::thread::spawn(move || finalizer_side.finalized(epoch));
/// state.wait_epoch_finalized(epoch);
/// assert_eq!(state.finalized_epoch(), epoch);
/// ```
#[derive(Debug, Default)]
pub struct GcEpochState {
    counters: Mutex<Counters>,
    scheduled_cond: Condvar,
    started_cond: Condvar,
    finished_cond: Condvar,
    finalized_cond: Condvar,
}

impl GcEpochState {
    /// Creates a state holder with every counter at [`Epoch::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a collection and returns the epoch it will carry.
    ///
    /// The returned epoch is strictly greater than the last started epoch.
    /// Calling this again before that epoch starts returns the same value.
    pub fn schedule(&self) -> Epoch {
        let mut counters = self.counters.lock();
        if counters.scheduled <= counters.started {
            counters.scheduled = counters.started.next();
            self.scheduled_cond.notify_all();
        }
        counters.scheduled
    }

    /// Records that the collection for `epoch` has started.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `epoch` is lower than the last started epoch.
    pub fn start(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        debug_assert!(
            epoch >= counters.started,
            "epoch {epoch} started after {}",
            counters.started
        );
        counters.started = counters.started.max(epoch);
        self.started_cond.notify_all();
    }

    /// Records that the collection for `epoch` has finished sweeping.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `epoch` is lower than the last finished epoch.
    pub fn finish(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        debug_assert!(
            epoch >= counters.finished,
            "epoch {epoch} finished after {}",
            counters.finished
        );
        counters.finished = counters.finished.max(epoch);
        self.finished_cond.notify_all();
    }

    /// Records that every finalizer of `epoch` has run.
    ///
    /// Reports for an older epoch than the current high-water mark are
    /// absorbed: the counter never moves backwards.
    pub fn finalized(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        counters.finalized = counters.finalized.max(epoch);
        self.finalized_cond.notify_all();
    }

    /// Blocks until `epoch` has finished or the state is shut down.
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        while counters.finished < epoch && !counters.shutdown {
            self.finished_cond.wait(&mut counters);
        }
    }

    /// Blocks until `epoch` has been finalized or the state is shut down.
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        while counters.finalized < epoch && !counters.shutdown {
            self.finalized_cond.wait(&mut counters);
        }
    }

    /// Blocks until `epoch` has started or the state is shut down.
    pub fn wait_epoch_started(&self, epoch: Epoch) {
        let mut counters = self.counters.lock();
        while counters.started < epoch && !counters.shutdown {
            self.started_cond.wait(&mut counters);
        }
    }

    /// Blocks until a collection is scheduled that has not started yet.
    ///
    /// This is what a dedicated GC thread sleeps on between cycles.
    /// Returns `None` once the state has been shut down.
    pub fn wait_scheduled(&self) -> Option<Epoch> {
        let mut counters = self.counters.lock();
        while counters.scheduled <= counters.started && !counters.shutdown {
            self.scheduled_cond.wait(&mut counters);
        }
        if counters.shutdown {
            None
        } else {
            Some(counters.scheduled)
        }
    }

    /// Wakes every waiter and makes all future waits return immediately.
    ///
    /// Irreversible.
    pub fn shutdown(&self) {
        let mut counters = self.counters.lock();
        counters.shutdown = true;
        self.scheduled_cond.notify_all();
        self.started_cond.notify_all();
        self.finished_cond.notify_all();
        self.finalized_cond.notify_all();
    }

    /// Last scheduled epoch.
    #[must_use]
    pub fn scheduled(&self) -> Epoch {
        self.counters.lock().scheduled
    }

    /// Last started epoch.
    #[must_use]
    pub fn started(&self) -> Epoch {
        self.counters.lock().started
    }

    /// Last finished epoch.
    #[must_use]
    pub fn finished(&self) -> Epoch {
        self.counters.lock().finished
    }

    /// Highest epoch whose finalizers have all run.
    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        self.counters.lock().finalized
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.counters.lock().shutdown
    }
}
