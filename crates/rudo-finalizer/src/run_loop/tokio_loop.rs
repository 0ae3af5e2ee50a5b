//! [`RunLoop`] on top of a tokio runtime.
//!
//! Every source and timer becomes one spawned task. Use a current-thread
//! runtime with the time driver enabled so that all callbacks run on the
//! thread that drives it:
//!
//! ```
//! use rudo_finalizer::run_loop::TokioRunLoop;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//! let run_loop = TokioRunLoop::new(runtime.handle().clone());
//! # drop(run_loop);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ::tokio::runtime::Handle;
use ::tokio::sync::{watch, Notify};
use ::tokio::task::JoinHandle;
use ::tokio::time::{timeout_at, Instant};
use parking_lot::Mutex;

use super::{enter, CurrentLoopGuard, LoopCallback, PostedTask, RunLoop, SourceId, TimerId};

#[derive(Default)]
struct Tasks {
    sources: HashMap<SourceId, (Arc<Notify>, JoinHandle<()>)>,
    timers: HashMap<TimerId, (watch::Sender<Option<Instant>>, JoinHandle<()>)>,
}

/// A [`RunLoop`] whose callbacks run as tasks on a tokio runtime.
pub struct TokioRunLoop {
    runtime: Handle,
    this: Weak<Self>,
    tasks: Mutex<Tasks>,
    next_id: AtomicU64,
}

impl TokioRunLoop {
    /// Wraps `runtime`. Callbacks run wherever that runtime polls its tasks.
    #[must_use]
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            runtime,
            this: Weak::clone(this),
            tasks: Mutex::new(Tasks::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Makes this loop the [`current`](super::current) loop of the calling
    /// thread, typically the thread inside `Runtime::block_on`.
    pub fn enter(self: &Arc<Self>) -> CurrentLoopGuard {
        enter(Arc::clone(self) as Arc<dyn RunLoop>)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// Tasks hold the loop weakly so that dropping the last handle aborts them.
fn run_as_current(this: &Weak<TokioRunLoop>, callback: impl FnOnce()) {
    let _current = this
        .upgrade()
        .map(|run_loop| enter(run_loop as Arc<dyn RunLoop>));
    callback();
}

impl RunLoop for TokioRunLoop {
    fn post(&self, task: PostedTask) {
        let this = Weak::clone(&self.this);
        drop(self.runtime.spawn(async move {
            run_as_current(&this, task);
        }));
    }

    fn add_source(&self, callback: LoopCallback) -> SourceId {
        let id = SourceId(self.next_id());
        let notify = Arc::new(Notify::new());
        let wakeups = Arc::clone(&notify);
        let this = Weak::clone(&self.this);
        let task = self.runtime.spawn(async move {
            loop {
                wakeups.notified().await;
                run_as_current(&this, &*callback);
            }
        });
        self.tasks.lock().sources.insert(id, (notify, task));
        id
    }

    fn signal(&self, source: SourceId) {
        if let Some((notify, _)) = self.tasks.lock().sources.get(&source) {
            // A stored permit makes repeated signals coalesce.
            notify.notify_one();
        }
    }

    fn remove_source(&self, source: SourceId) {
        if let Some((_, task)) = self.tasks.lock().sources.remove(&source) {
            task.abort();
        }
    }

    fn add_timer(&self, callback: LoopCallback) -> TimerId {
        let id = TimerId(self.next_id());
        let (deadline_tx, mut deadline_rx) = watch::channel(None::<Instant>);
        let this = Weak::clone(&self.this);
        let task = self.runtime.spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                let Some(at) = deadline else {
                    if deadline_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                };
                match timeout_at(at, deadline_rx.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_elapsed) => {
                        run_as_current(&this, &*callback);
                        if deadline_rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().timers.insert(id, (deadline_tx, task));
        id
    }

    fn arm_timer(&self, timer: TimerId, after: Duration) {
        if let Some((deadline, _)) = self.tasks.lock().timers.get(&timer) {
            deadline.send_replace(Instant::now().checked_add(after));
        }
    }

    fn remove_timer(&self, timer: TimerId) {
        if let Some((_, task)) = self.tasks.lock().timers.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TokioRunLoop {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for (_, task) in tasks.sources.drain().map(|(_, entry)| entry) {
            task.abort();
        }
        for (_, task) in tasks.timers.drain().map(|(_, entry)| entry) {
            task.abort();
        }
    }
}

impl fmt::Debug for TokioRunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.tasks.lock();
        f.debug_struct("TokioRunLoop")
            .field("sources", &tasks.sources.len())
            .field("timers", &tasks.timers.len())
            .finish_non_exhaustive()
    }
}
