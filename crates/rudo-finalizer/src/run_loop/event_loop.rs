//! A minimal single-threaded cooperative event loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{enter, LoopCallback, PostedTask, RunLoop, SourceId, TimerId};

enum Wake {
    Posted(PostedTask),
    Signal(SourceId),
    TimersChanged,
    Stop,
}

struct SourceEntry {
    callback: LoopCallback,
    pending: bool,
}

struct TimerEntry {
    callback: LoopCallback,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    sources: HashMap<SourceId, SourceEntry>,
    timers: HashMap<TimerId, TimerEntry>,
}

struct Shared {
    sender: Sender<Wake>,
    receiver: Receiver<Wake>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wake(&self, wake: Wake) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.sender.send(wake);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.registry
            .lock()
            .timers
            .values()
            .filter_map(|timer| timer.deadline)
            .min()
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<LoopCallback> = {
            let mut registry = self.registry.lock();
            registry
                .timers
                .values_mut()
                .filter(|timer| timer.deadline.is_some_and(|deadline| deadline <= now))
                .map(|timer| {
                    timer.deadline = None;
                    Arc::clone(&timer.callback)
                })
                .collect()
        };
        for callback in due {
            callback();
        }
    }

    fn dispatch_signal(&self, source: SourceId) {
        let callback = {
            let mut registry = self.registry.lock();
            registry.sources.get_mut(&source).map(|entry| {
                entry.pending = false;
                Arc::clone(&entry.callback)
            })
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl RunLoop for Shared {
    fn post(&self, task: PostedTask) {
        self.wake(Wake::Posted(task));
    }

    fn add_source(&self, callback: LoopCallback) -> SourceId {
        let id = SourceId(self.next_id());
        self.registry.lock().sources.insert(
            id,
            SourceEntry {
                callback,
                pending: false,
            },
        );
        id
    }

    fn signal(&self, source: SourceId) {
        let newly_pending = {
            let mut registry = self.registry.lock();
            match registry.sources.get_mut(&source) {
                Some(entry) if !entry.pending => {
                    entry.pending = true;
                    true
                }
                _ => false,
            }
        };
        if newly_pending {
            self.wake(Wake::Signal(source));
        }
    }

    fn remove_source(&self, source: SourceId) {
        self.registry.lock().sources.remove(&source);
    }

    fn add_timer(&self, callback: LoopCallback) -> TimerId {
        let id = TimerId(self.next_id());
        self.registry.lock().timers.insert(
            id,
            TimerEntry {
                callback,
                deadline: None,
            },
        );
        id
    }

    fn arm_timer(&self, timer: TimerId, after: Duration) {
        let armed = {
            let mut registry = self.registry.lock();
            registry.timers.get_mut(&timer).is_some_and(|entry| {
                // A delay past the end of time leaves the timer disarmed.
                entry.deadline = Instant::now().checked_add(after);
                true
            })
        };
        if armed {
            self.wake(Wake::TimersChanged);
        }
    }

    fn remove_timer(&self, timer: TimerId) {
        self.registry.lock().timers.remove(&timer);
    }
}

/// A single-threaded cooperative event loop.
///
/// Whichever thread calls one of the `run*` methods drives the loop: posted
/// tasks, signalled sources and due timers are dispatched there, one at a
/// time, and the loop is the [`current`](super::current) loop of that thread
/// while it runs. Between callbacks the thread sleeps on a channel until the
/// next wakeup or timer deadline.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rudo_finalizer::run_loop::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let ran = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&ran);
/// event_loop
///     .handle()
///     .post(Box::new(move || flag.store(true, Ordering::SeqCst)));
///
/// assert!(event_loop.run_until(Duration::from_secs(1), || ran.load(Ordering::SeqCst)));
/// ```
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Creates an idle loop.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Thread-safe handle used to post work and register sources or timers.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn RunLoop> {
        Arc::clone(&self.shared) as Arc<dyn RunLoop>
    }

    /// Asks a running loop to return. A stop sent while the loop is not
    /// running makes the next `run*` call return on its first wakeup.
    pub fn stop(&self) {
        self.shared.wake(Wake::Stop);
    }

    /// Drives the loop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) {
        self.drive(None, || false);
    }

    /// Drives the loop for `duration`, or until stopped.
    pub fn run_for(&self, duration: Duration) {
        self.drive(Instant::now().checked_add(duration), || false);
    }

    /// Drives the loop until `done` returns true, the loop is stopped, or
    /// `timeout` elapses. Returns the final value of `done`.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        self.drive(Instant::now().checked_add(timeout), &mut done);
        done()
    }

    fn drive<F>(&self, until: Option<Instant>, mut done: F)
    where
        F: FnMut() -> bool,
    {
        let _current = enter(self.handle());
        let shared = &*self.shared;

        loop {
            if done() {
                return;
            }
            let wake_at = match (shared.next_deadline(), until) {
                (Some(timer), Some(limit)) => Some(timer.min(limit)),
                (timer, limit) => timer.or(limit),
            };
            let received = match wake_at {
                Some(at) => shared.receiver.recv_deadline(at),
                None => shared
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Wake::Posted(task)) => task(),
                Ok(Wake::Signal(source)) => shared.dispatch_signal(source),
                Ok(Wake::TimersChanged) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Wake::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            }
            shared.fire_due_timers();
            if until.is_some_and(|limit| Instant::now() >= limit) {
                return;
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("EventLoop")
            .field("sources", &registry.sources.len())
            .field("timers", &registry.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::EventLoop;
    use crate::run_loop::current;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_signals_coalesce_until_dispatched() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = handle.add_source(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handle.signal(source);
        handle.signal(source);
        handle.signal(source);
        event_loop.run_for(Duration::from_millis(20));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_fires_once_after_delay() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let fired_at = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&fired_at);
        let timer = handle.add_timer(Arc::new(move || record.lock().push(Instant::now())));

        let armed_at = Instant::now();
        handle.arm_timer(timer, Duration::from_millis(15));
        event_loop.run_for(Duration::from_millis(60));

        let fired = fired_at.lock();
        assert_eq!(fired.len(), 1);
        assert!(fired[0] - armed_at >= Duration::from_millis(15));
    }

    #[test]
    fn test_removed_source_is_ignored() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = handle.add_source(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        handle.remove_source(source);
        handle.signal(source);
        event_loop.run_for(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loop_is_current_while_running() {
        let event_loop = EventLoop::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&seen);
        event_loop.handle().post(Box::new(move || {
            if current().is_some() {
                flag.store(1, Ordering::SeqCst);
            }
        }));
        assert!(event_loop.run_until(Duration::from_secs(1), || seen.load(Ordering::SeqCst) == 1));
        assert!(current().is_none());
    }

    #[test]
    fn test_stop_from_other_thread() {
        let event_loop = Arc::new(EventLoop::new());
        let stopper = {
            let event_loop = Arc::clone(&event_loop);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event_loop.stop();
            })
        };
        let started = Instant::now();
        event_loop.run();
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unbounded_delays_do_not_overflow() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let timer = handle.add_timer(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handle.arm_timer(timer, Duration::MAX);
        event_loop.run_for(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(event_loop.run_until(Duration::MAX, || true));
    }
}
