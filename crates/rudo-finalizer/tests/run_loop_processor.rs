//! Integration tests for run-loop finalizer draining.

use parking_lot::Mutex;
use rudo_finalizer::processor::{ResourcePool, RunLoopProcessor};
use rudo_finalizer::run_loop::{self, EventLoop};
use rudo_finalizer::{Epoch, FinalizerQueue, RunLoopConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Span {
    name: &'static str,
    start: Instant,
    end: Instant,
}

type Spans = Arc<Mutex<Vec<Span>>>;

fn timed_batch(spans: &Spans, names: &[&'static str], work: Duration) -> FinalizerQueue {
    names
        .iter()
        .map(|&name| {
            let spans = Arc::clone(spans);
            move || {
                let start = Instant::now();
                thread::sleep(work);
                spans.lock().push(Span {
                    name,
                    start,
                    end: Instant::now(),
                });
            }
        })
        .collect()
}

fn completions() -> (Arc<Mutex<Vec<Epoch>>>, impl Fn(Epoch) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |epoch| sink.lock().push(epoch))
}

#[test]
fn test_turns_respect_minimum_spacing() {
    let spacing = Duration::from_millis(30);
    let (seen, on_finalized) = completions();
    let processor = RunLoopProcessor::new(on_finalized);
    processor.with_config(|config| {
        *config = RunLoopConfig {
            max_time_in_task: Duration::from_millis(5),
            min_time_between_tasks: spacing,
            batch_size: 1,
        };
    });

    let spans: Spans = Arc::new(Mutex::new(Vec::new()));
    let work = Duration::from_millis(8);
    processor.schedule(timed_batch(&spans, &["a0", "a1"], work), Epoch(1));
    processor.schedule(timed_batch(&spans, &["b0", "b1"], work), Epoch(2));

    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());
    let _subscription = processor.attach_to_current_loop().unwrap();
    assert!(event_loop.run_until(TIMEOUT, || seen.lock().len() == 2));

    let spans = spans.lock().clone();
    let names: Vec<_> = spans.iter().map(|span| span.name).collect();
    assert_eq!(names, ["a0", "a1", "b0", "b1"]);

    // Every task overruns the budget, so a turn ends after each group except
    // where a batch completes and the next one starts in the same turn.
    assert!(spans[1].start - spans[0].end >= spacing);
    assert!(spans[2].start - spans[0].end >= spacing);
    assert!(spans[3].start - spans[2].end >= spacing);
    assert_eq!(*seen.lock(), vec![Epoch(1), Epoch(2)]);

    let stats = processor.metrics();
    assert_eq!(stats.tasks_run, 4);
    assert_eq!(stats.batches_drained, 2);
    assert!(stats.deadline_exceeded_turns >= 2);
}

#[test]
fn test_batch_scheduled_mid_drain_waits_its_turn() {
    let (seen, on_finalized) = completions();
    let processor = Arc::new(RunLoopProcessor::new(on_finalized));
    processor.with_config(|config| {
        config.max_time_in_task = Duration::from_millis(2);
        config.min_time_between_tasks = Duration::from_millis(1);
        config.batch_size = 1;
    });

    let spans: Spans = Arc::new(Mutex::new(Vec::new()));
    let mut first = timed_batch(&spans, &["a0"], Duration::from_millis(3));
    {
        let processor = Arc::clone(&processor);
        let late = timed_batch(&spans, &["b0", "b1"], Duration::ZERO);
        first.push_fn(move || processor.schedule(late, Epoch(2)));
    }
    first.merge_with(timed_batch(
        &spans,
        &["a1", "a2", "a3"],
        Duration::from_millis(3),
    ));
    processor.schedule(first, Epoch(1));

    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());
    let _subscription = processor.attach_to_current_loop().unwrap();
    assert!(event_loop.run_until(TIMEOUT, || seen.lock().len() == 2));

    let names: Vec<_> = spans.lock().iter().map(|span| span.name).collect();
    assert_eq!(names, ["a0", "a1", "a2", "a3", "b0", "b1"]);
    assert_eq!(*seen.lock(), vec![Epoch(1), Epoch(2)]);
    assert!(processor.metrics().loop_turns > 1);
}

struct CountingPool {
    scopes: Arc<AtomicUsize>,
}

impl ResourcePool for CountingPool {
    fn scoped(&self, body: &mut dyn FnMut()) {
        self.scopes.fetch_add(1, Ordering::SeqCst);
        body();
    }
}

#[test]
fn test_pool_scope_per_group() {
    let scopes = Arc::new(AtomicUsize::new(0));
    let (seen, on_finalized) = completions();
    let processor = RunLoopProcessor::new(on_finalized).with_pool(CountingPool {
        scopes: Arc::clone(&scopes),
    });
    processor.with_config(|config| {
        config.batch_size = 4;
        config.max_time_in_task = Duration::from_secs(5);
    });

    let in_scope = Arc::new(Mutex::new(Vec::new()));
    let batch: FinalizerQueue = (0..10)
        .map(|_| {
            let scopes = Arc::clone(&scopes);
            let in_scope = Arc::clone(&in_scope);
            move || in_scope.lock().push(scopes.load(Ordering::SeqCst))
        })
        .collect();
    processor.schedule(batch, Epoch(1));

    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());
    let _subscription = processor.attach_to_current_loop().unwrap();
    assert!(event_loop.run_until(TIMEOUT, || !seen.lock().is_empty()));

    assert_eq!(scopes.load(Ordering::SeqCst), 3);
    assert_eq!(*in_scope.lock(), vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3]);
}

#[test]
fn test_schedule_from_other_thread_wakes_loop() {
    let (seen, on_finalized) = completions();
    let processor = Arc::new(RunLoopProcessor::new(on_finalized));
    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());
    let _subscription = processor.attach_to_current_loop().unwrap();

    let loop_thread = thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let producer = {
        let processor = Arc::clone(&processor);
        let ran_on = Arc::clone(&ran_on);
        thread::spawn(move || {
            let mut batch = FinalizerQueue::new();
            batch.push_fn(move || *ran_on.lock() = Some(thread::current().id()));
            processor.schedule(batch, Epoch(1));
        })
    };

    assert!(event_loop.run_until(TIMEOUT, || !seen.lock().is_empty()));
    producer.join().unwrap();
    assert_eq!(*ran_on.lock(), Some(loop_thread));
}

#[test]
fn test_detached_processor_keeps_work_until_reattached() {
    let (seen, on_finalized) = completions();
    let processor = RunLoopProcessor::new(on_finalized);
    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());

    let subscription = processor.attach_to_current_loop().unwrap();
    drop(subscription);

    let mut batch = FinalizerQueue::new();
    batch.push_fn(|| {});
    processor.schedule(batch, Epoch(1));
    event_loop.run_for(Duration::from_millis(20));
    assert!(seen.lock().is_empty());

    let _subscription = processor.attach_to_current_loop().unwrap();
    assert!(event_loop.run_until(TIMEOUT, || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![Epoch(1)]);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "attached to two loops")]
fn test_double_attach_panics() {
    let processor = RunLoopProcessor::new(|_| {});
    let event_loop = EventLoop::new();
    let _current = run_loop::enter(event_loop.handle());
    let _first = processor.attach_to_current_loop();
    let _second = processor.attach_to_current_loop();
}
