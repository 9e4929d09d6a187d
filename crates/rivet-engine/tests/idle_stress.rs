//! Idle tracker behavior under single transitions and heavy contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rivet_engine::{EndpointConfig, Engine, IdleState, IdleTracker};

#[test]
fn test_single_transition_emits_exactly_one_idle_event() {
    let engine = Engine::new(&EndpointConfig::new()).unwrap();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let tracker = IdleTracker::new(engine.handle(), Duration::from_millis(300), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tracker.increase_call_count();
    tracker.decrease_call_count();
    std::thread::sleep(Duration::from_millis(600));

    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.active_calls(), 0);
    assert_eq!(tracker.state(), IdleState::Idle);
}

#[test]
fn test_eight_thread_stress_with_random_pauses() {
    let engine = Engine::new(&EndpointConfig::new()).unwrap();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let tracker = Arc::new(IdleTracker::new(
        engine.handle(),
        Duration::from_millis(50),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..10_000 {
                    tracker.increase_call_count();
                    if rng.gen_bool(0.01) {
                        std::thread::sleep(Duration::from_micros(rng.gen_range(1..50)));
                    }
                    tracker.decrease_call_count();
                    if rng.gen_bool(0.01) {
                        std::thread::sleep(Duration::from_micros(rng.gen_range(1..50)));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tracker.active_calls(), 0);
    // The final quiet span must produce an idle event.
    std::thread::sleep(Duration::from_millis(500));
    assert!(events.load(Ordering::SeqCst) >= 1);
    assert_eq!(tracker.active_calls(), 0);
    tracker.disconnect();
}

#[test]
fn test_interleaved_quiet_spans_each_emit_once() {
    let engine = Engine::new(&EndpointConfig::new()).unwrap();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let tracker = IdleTracker::new(engine.handle(), Duration::from_millis(100), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        tracker.increase_call_count();
        tracker.decrease_call_count();
        std::thread::sleep(Duration::from_millis(300));
    }
    assert_eq!(events.load(Ordering::SeqCst), 3);
}
