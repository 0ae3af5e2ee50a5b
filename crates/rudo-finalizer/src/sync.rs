//! # Lock Ordering Discipline
//!
//! The background finalizer processor owns two mutexes:
//!
//! | Level | Lock            | Guards                                        |
//! |-------|-----------------|-----------------------------------------------|
//! | 1     | `WorkerSlot`    | the worker `JoinHandle` (spawn, stop, join)   |
//! | 2     | `PendingQueue`  | pending batches, epoch stamps, gating flags   |
//!
//! Scheduling and the worker loop only ever hold `PendingQueue`, and never
//! while running finalizers. Spawning holds only `WorkerSlot`. The single
//! nested acquisition is `stop_thread`, which keeps `WorkerSlot` for the whole
//! stop and briefly takes `PendingQueue` to raise the shutdown flag and to
//! re-open scheduling after the join. Levels must therefore be acquired in
//! increasing order; taking `WorkerSlot` while holding `PendingQueue` would
//! deadlock against a concurrent stop.
//!
//! In debug builds [`LockGuard`] validates this per thread.

#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
const MAX_LOCK_DEPTH: usize = 4;

#[cfg(debug_assertions)]
thread_local!(
    static LOCK_STACK: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH))
);

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Slot holding the worker thread handle (level 1).
    WorkerSlot = 1,
    /// Pending batch queue of a processor (level 2).
    PendingQueue = 2,
}

impl LockOrder {
    /// Conceptual level of this lock in the acquisition hierarchy.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// Records a lock acquisition for ordering validation.
///
/// Create the guard right before locking and keep it alive for as long as
/// the lock is held. Free in release builds.
#[must_use = "LockGuard must be held for the duration of the critical section"]
#[derive(Debug)]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates and records acquiring `tag` on the current thread.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of an equal or higher level is
    /// already held by this thread.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = LOCK_STACK.try_with(|stack| {
                let mut stack = stack.borrow_mut();
                if let Some(&held) = stack.last() {
                    debug_assert!(
                        tag.level() > held,
                        "Lock ordering violation: {tag:?} (level {}) acquired while holding level {held}",
                        tag.level()
                    );
                }
                stack.push(tag.level());
            });
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_STACK.try_with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Level of the most recently recorded lock on this thread, if any.
#[cfg(all(test, debug_assertions))]
fn held_level() -> Option<u8> {
    LOCK_STACK
        .try_with(|stack| stack.borrow().last().copied())
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::{LockGuard, LockOrder};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::WorkerSlot.level(), 1);
        assert_eq!(LockOrder::PendingQueue.level(), 2);
    }

    #[test]
    fn test_increasing_order_is_allowed() {
        let _slot = LockGuard::new(LockOrder::WorkerSlot);
        let _queue = LockGuard::new(LockOrder::PendingQueue);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_guard_drop_restores_state() {
        use super::held_level;

        {
            let _queue = LockGuard::new(LockOrder::PendingQueue);
            assert_eq!(held_level(), Some(2));
        }
        assert_eq!(held_level(), None);
        let _slot = LockGuard::new(LockOrder::WorkerSlot);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_slot_after_queue_panics() {
        let _queue = LockGuard::new(LockOrder::PendingQueue);
        let _slot = LockGuard::new(LockOrder::WorkerSlot);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_reentrant_queue_panics() {
        let _first = LockGuard::new(LockOrder::PendingQueue);
        let _second = LockGuard::new(LockOrder::PendingQueue);
    }
}
