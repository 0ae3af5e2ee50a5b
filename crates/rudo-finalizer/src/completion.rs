//! Joining completion reports from the two finalizer partitions.
//!
//! A segregated batch is drained by two processors that report independently
//! and in no particular order relative to each other. [`EpochJoin`] records
//! an epoch as finalized in the [`GcEpochState`] only once neither side still
//! owes work for it or for any earlier epoch.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::state::{Epoch, GcEpochState};

#[derive(Debug, Default)]
struct Ledger {
    /// Registered epochs not yet reported as finalized.
    registered: BTreeSet<Epoch>,
    /// Epochs with a non-empty regular partition still draining.
    regular: BTreeSet<Epoch>,
    /// Epochs with a non-empty main-thread partition still draining.
    main_thread: BTreeSet<Epoch>,
}

impl Ledger {
    /// Highest registered epoch with nothing outstanding at or below it.
    fn settled(&self) -> Option<Epoch> {
        let blocking = match (self.regular.first(), self.main_thread.first()) {
            (Some(&a), Some(&b)) => Some(a.min(b)),
            (a, b) => a.or(b).copied(),
        };
        match blocking {
            Some(limit) => self.registered.range(..limit).next_back().copied(),
            None => self.registered.last().copied(),
        }
    }
}

/// Combines per-partition completion reports into [`GcEpochState::finalized`].
///
/// The dispatcher [`register`](Self::register)s every epoch before handing
/// its partitions over; each processor then reports through
/// [`regular_completed`](Self::regular_completed) or
/// [`main_thread_completed`](Self::main_thread_completed). Because each side
/// drains in schedule order, a report for `e` settles every earlier epoch of
/// that side too. Reports for epochs a side never owed work for are harmless.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_finalizer::completion::EpochJoin;
/// use rudo_finalizer::{Epoch, GcEpochState};
///
/// let state = Arc::new(GcEpochState::new());
/// let join = EpochJoin::new(Arc::clone(&state));
///
/// join.register(Epoch(1), true, true);
/// join.regular_completed(Epoch(1));
/// assert_eq!(state.finalized_epoch(), Epoch(0));
/// join.main_thread_completed(Epoch(1));
/// assert_eq!(state.finalized_epoch(), Epoch(1));
/// ```
pub struct EpochJoin {
    state: Arc<GcEpochState>,
    ledger: Mutex<Ledger>,
}

impl EpochJoin {
    /// Creates a join reporting into `state`.
    #[must_use]
    pub fn new(state: Arc<GcEpochState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    /// Announces `epoch` and which of its partitions carry work.
    ///
    /// An epoch with two empty partitions is finalized right away, unless
    /// an earlier epoch is still outstanding.
    pub fn register(&self, epoch: Epoch, regular: bool, main_thread: bool) {
        let mut ledger = self.ledger.lock();
        ledger.registered.insert(epoch);
        if regular {
            ledger.regular.insert(epoch);
        }
        if main_thread {
            ledger.main_thread.insert(epoch);
        }
        self.publish(&mut ledger);
    }

    /// Records that the regular side has drained everything up to `epoch`.
    pub fn regular_completed(&self, epoch: Epoch) {
        let mut ledger = self.ledger.lock();
        ledger.regular = ledger.regular.split_off(&epoch.next());
        self.publish(&mut ledger);
    }

    /// Records that the main-thread side has drained everything up to `epoch`.
    pub fn main_thread_completed(&self, epoch: Epoch) {
        let mut ledger = self.ledger.lock();
        ledger.main_thread = ledger.main_thread.split_off(&epoch.next());
        self.publish(&mut ledger);
    }

    /// Number of registered epochs not yet finalized.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().registered.len()
    }

    // Reported under the ledger lock so the state never sees epochs out of order.
    fn publish(&self, ledger: &mut Ledger) {
        if let Some(settled) = ledger.settled() {
            ledger.registered = ledger.registered.split_off(&settled.next());
            self.state.finalized(settled);
        }
    }
}

impl fmt::Debug for EpochJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochJoin")
            .field("ledger", &*self.ledger.lock())
            .finish_non_exhaustive()
    }
}
