//! Finalizer batches handed over by the collector.
//!
//! A [`FinalizerQueue`] is the ordered list of finalizers one GC cycle found
//! to be due. The collector builds it, tags it with the cycle's epoch when it
//! calls `schedule`, and moves it into a processor. Tasks are consumed as they
//! run; nothing is ever cloned.

use std::collections::VecDeque;
use std::fmt;

/// One finalizer call.
///
/// Opaque to this crate: it is invoked exactly once, with no arguments, on
/// whichever thread the processor drains on.
pub type FinalizerTask = Box<dyn FnOnce() + Send + 'static>;

/// Ordered batch of finalizer tasks.
#[derive(Default)]
pub struct FinalizerQueue {
    tasks: VecDeque<FinalizerTask>,
}

impl FinalizerQueue {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a boxed task.
    pub fn push(&mut self, task: FinalizerTask) {
        self.tasks.push_back(task);
    }

    /// Appends a closure as a task.
    pub fn push_fn<F>(&mut self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(task));
    }

    /// Number of tasks still in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the batch holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Moves every task of `other` to the back of this batch, keeping order.
    pub fn merge_with(&mut self, mut other: Self) {
        if self.tasks.is_empty() {
            self.tasks = other.tasks;
        } else {
            self.tasks.append(&mut other.tasks);
        }
    }

    /// Removes the next task to run.
    pub fn pop_front(&mut self) -> Option<FinalizerTask> {
        self.tasks.pop_front()
    }

    /// Runs up to `limit` tasks from the front and returns how many ran.
    pub fn run_front(&mut self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Some(task) = self.pop_front() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Runs every task in order, consuming the batch.
    pub fn finalize(self) -> usize {
        let count = self.tasks.len();
        for task in self.tasks {
            task();
        }
        count
    }
}

impl fmt::Debug for FinalizerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerQueue")
            .field("len", &self.tasks.len())
            .finish()
    }
}

impl<F> FromIterator<F> for FinalizerQueue
where
    F: FnOnce() + Send + 'static,
{
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Self {
            tasks: iter
                .into_iter()
                .map(|task| Box::new(task) as FinalizerTask)
                .collect(),
        }
    }
}

/// A batch split by where its finalizers are allowed to run.
///
/// `regular` finalizers may run on any thread. `main_thread` finalizers
/// touch objects owned by the host's main thread and must run there, unless
/// no main-thread processor is available, in which case the dispatcher folds
/// them into `regular` with [`merge_into_regular`](Self::merge_into_regular).
#[derive(Debug, Default)]
pub struct SegregatedFinalizerQueue {
    /// Finalizers runnable on the background finalizer thread.
    pub regular: FinalizerQueue,
    /// Finalizers that must run on the host's main thread.
    pub main_thread: FinalizerQueue,
}

impl SegregatedFinalizerQueue {
    /// Creates an empty segregated batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of tasks across both partitions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.regular.len() + self.main_thread.len()
    }

    /// Whether both partitions are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.main_thread.is_empty()
    }

    /// Appends every main-thread task to `regular` and empties `main_thread`.
    pub fn merge_into_regular(&mut self) {
        let main_thread = std::mem::take(&mut self.main_thread);
        self.regular.merge_with(main_thread);
    }

    /// Splits the batch into its `(regular, main_thread)` partitions.
    #[must_use]
    pub fn into_parts(self) -> (FinalizerQueue, FinalizerQueue) {
        (self.regular, self.main_thread)
    }
}
