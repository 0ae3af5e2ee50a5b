//! Integration tests for the GC epoch state machine.

use rudo_finalizer::{Epoch, GcEpochState};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_schedule_is_idempotent_until_start() {
    let state = GcEpochState::new();
    let first = state.schedule();
    assert_eq!(first, Epoch(1));
    assert_eq!(state.schedule(), first);

    state.start(first);
    let second = state.schedule();
    assert_eq!(second, Epoch(2));
    assert!(second > state.started());
}

#[test]
fn test_counters_keep_their_order_through_a_cycle() {
    let state = GcEpochState::new();
    for _ in 0..5 {
        let epoch = state.schedule();
        state.start(epoch);
        state.finish(epoch);
        state.finalized(epoch);

        assert!(state.finalized_epoch() <= state.finished());
        assert!(state.finished() <= state.started());
        assert!(state.started() <= state.scheduled());
    }
    assert_eq!(state.finalized_epoch(), Epoch(5));
}

#[test]
fn test_wait_finalized_wakes_on_report() {
    let state = Arc::new(GcEpochState::new());
    let epoch = state.schedule();
    state.start(epoch);
    state.finish(epoch);

    let reporter = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            state.finalized(epoch);
        })
    };
    state.wait_epoch_finalized(epoch);
    assert_eq!(state.finalized_epoch(), epoch);
    reporter.join().unwrap();
}

#[test]
fn test_wait_finished_wakes_on_report() {
    let state = Arc::new(GcEpochState::new());
    let epoch = state.schedule();

    let collector = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            state.start(epoch);
            thread::sleep(Duration::from_millis(10));
            state.finish(epoch);
        })
    };
    state.wait_epoch_finished(epoch);
    assert!(state.finished() >= epoch);
    collector.join().unwrap();
}

#[test]
fn test_shutdown_releases_every_waiter() {
    let state = Arc::new(GcEpochState::new());
    let waiters: Vec<_> = (0..4)
        .map(|i| {
            let state = Arc::clone(&state);
            thread::spawn(move || match i {
                0 => state.wait_epoch_finished(Epoch(10)),
                1 => state.wait_epoch_finalized(Epoch(10)),
                2 => state.wait_epoch_started(Epoch(10)),
                _ => assert!(state.wait_scheduled().is_none()),
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    state.shutdown();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert!(state.is_shutdown());
    assert_eq!(state.finalized_epoch(), Epoch(0));
}

#[test]
fn test_gc_thread_sleeps_until_scheduled() {
    let state = Arc::new(GcEpochState::new());
    let gc_thread = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            let mut collected = Vec::new();
            while let Some(epoch) = state.wait_scheduled() {
                state.start(epoch);
                state.finish(epoch);
                state.finalized(epoch);
                collected.push(epoch);
            }
            collected
        })
    };

    let first = state.schedule();
    state.wait_epoch_finalized(first);
    let second = state.schedule();
    state.wait_epoch_finalized(second);
    state.shutdown();

    assert_eq!(gc_thread.join().unwrap(), vec![Epoch(1), Epoch(2)]);
}

#[test]
fn test_late_finalized_report_is_absorbed() {
    let state = GcEpochState::new();
    state.finalized(Epoch(3));
    state.finalized(Epoch(2));
    assert_eq!(state.finalized_epoch(), Epoch(3));
}
