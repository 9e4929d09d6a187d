//! Client-side idle tracking.
//!
//! The tracker turns a stream of concurrent call arrival/departure events
//! into a single deferred idle notification: exactly one event fires once
//! the channel has had zero active calls for a continuous `timeout` span.
//! The fast path is lock-free; a transient `Processing` state serializes the
//! rare transitions that touch shared data. The timer is single-shot and is
//! never re-armed after [`IdleTracker::disconnect`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::engine::EngineHandle;
use crate::task::TaskHandle;

const STATE_IDLE: u8 = 0;
const STATE_CALLS_ACTIVE: u8 = 1;
const STATE_TIMER_PENDING: u8 = 2;
const STATE_TIMER_PENDING_CALLS_ACTIVE: u8 = 3;
const STATE_TIMER_PENDING_CALLS_SEEN: u8 = 4;
const STATE_PROCESSING: u8 = 5;

/// Observable tracker state.
///
/// `TimerPending` means the armed timer is valid: if it fires in that state
/// the channel goes idle. In `TimerPendingCallsActive` the armed timer is
/// stale and will be dropped on firing; in `TimerPendingCallsSeen` it is
/// stale but firing re-arms it from the most recent quiet point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// No active calls, no timer; the channel is idle.
    Idle,
    /// At least one active call, no timer armed.
    CallsActive,
    /// Zero active calls and a valid armed timer.
    TimerPending,
    /// Calls arrived after the timer was armed and are still active.
    TimerPendingCallsActive,
    /// Calls came and went since the timer was armed; currently quiet.
    TimerPendingCallsSeen,
    /// A thread is serializing a rare transition.
    Processing,
}

impl From<u8> for IdleState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_IDLE => IdleState::Idle,
            STATE_CALLS_ACTIVE => IdleState::CallsActive,
            STATE_TIMER_PENDING => IdleState::TimerPending,
            STATE_TIMER_PENDING_CALLS_ACTIVE => IdleState::TimerPendingCallsActive,
            STATE_TIMER_PENDING_CALLS_SEEN => IdleState::TimerPendingCallsSeen,
            _ => IdleState::Processing,
        }
    }
}

struct IdleInner {
    engine: EngineHandle,
    timeout: Duration,
    state: AtomicU8,
    calls: AtomicIsize,
    // Written only by the event that took the counter to zero, read only by
    // the timer callback after acquiring the state that write released. The
    // busy loops on Processing keep accesses exclusive.
    last_quiet: UnsafeCell<Instant>,
    timer: Mutex<Option<TaskHandle>>,
    on_idle: Box<dyn Fn() + Send + Sync>,
}

// SAFETY: last_quiet is the only non-Sync field; the state machine grants at
// most one thread access to it at a time (see the field comment).
unsafe impl Sync for IdleInner {}

/// Tracks active calls on a channel and emits one idle event per quiet span.
///
/// Dropping the tracker disconnects it: the call count is parked above zero
/// so no further idle event can fire, and the armed timer is cancelled.
pub struct IdleTracker {
    inner: Arc<IdleInner>,
}

impl IdleTracker {
    /// Creates a tracker that calls `on_idle` after `timeout` of quiet.
    ///
    /// `timeout` is used as given; configuration-derived timeouts go through
    /// [`crate::config::idle_timeout_from_config`], which enforces the
    /// engine-wide minimum.
    pub fn new(
        engine: EngineHandle,
        timeout: Duration,
        on_idle: impl Fn() + Send + Sync + 'static,
    ) -> IdleTracker {
        IdleTracker {
            inner: Arc::new(IdleInner {
                engine,
                timeout,
                state: AtomicU8::new(STATE_IDLE),
                calls: AtomicIsize::new(0),
                last_quiet: UnsafeCell::new(Instant::now()),
                timer: Mutex::new(None),
                on_idle: Box::new(on_idle),
            }),
        }
    }

    /// Records a call arrival. Lock-free unless this call ends a quiet span.
    pub fn increase_call_count(&self) {
        increase(&self.inner);
    }

    /// Records a call departure. The departure that takes the count to zero
    /// arms (or marks for re-arm) the idle timer.
    pub fn decrease_call_count(&self) {
        decrease(&self.inner);
    }

    /// Permanently disables idle tracking.
    ///
    /// A synthetic call parks the machine in a busy state, so the timer can
    /// never be re-armed, and the armed timer (if any) is cancelled. Safe to
    /// call more than once.
    pub fn disconnect(&self) {
        increase(&self.inner);
        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            self.inner.engine.cancel(handle);
        }
        tracing::debug!("idle tracking disconnected");
    }

    /// Current call count. The synthetic disconnect call is included.
    pub fn active_calls(&self) -> isize {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// Current state, for observation only.
    pub fn state(&self) -> IdleState {
        IdleState::from(self.inner.state.load(Ordering::Relaxed))
    }
}

impl Drop for IdleTracker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for IdleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTracker")
            .field("state", &self.state())
            .field("calls", &self.active_calls())
            .finish()
    }
}

/// Bounded wait for a contended transition to settle.
fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins < 64 {
        std::hint::spin_loop();
    } else if *spins < 96 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn increase(inner: &Arc<IdleInner>) {
    let previous = inner.calls.fetch_add(1, Ordering::Relaxed);
    if previous != 0 {
        return;
    }
    // This arrival ends a quiet span; settle the state machine.
    let mut spins = 0u32;
    let mut state = inner.state.load(Ordering::Relaxed);
    loop {
        match state {
            STATE_IDLE => {
                // No timer armed and no competing transition in flight.
                inner.state.store(STATE_CALLS_ACTIVE, Ordering::Relaxed);
                return;
            }
            STATE_TIMER_PENDING | STATE_TIMER_PENDING_CALLS_SEEN => {
                // Acquire pairs with the release in decrease() so the timer
                // metadata written there is visible if we later re-arm.
                match inner.state.compare_exchange_weak(
                    state,
                    STATE_TIMER_PENDING_CALLS_ACTIVE,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => state = observed,
                }
            }
            _ => {
                backoff(&mut spins);
                state = inner.state.load(Ordering::Relaxed);
            }
        }
    }
}

fn decrease(inner: &Arc<IdleInner>) {
    let previous = inner.calls.fetch_sub(1, Ordering::Relaxed);
    if previous != 1 {
        return;
    }
    // This departure starts a quiet span. Exclusive access: any competing
    // increase or timer callback busy-waits until the state settles.
    unsafe {
        *inner.last_quiet.get() = Instant::now();
    }
    let mut spins = 0u32;
    let mut state = inner.state.load(Ordering::Relaxed);
    loop {
        match state {
            STATE_CALLS_ACTIVE => {
                arm_timer(inner);
                // Release publishes last_quiet to the timer callback.
                inner.state.store(STATE_TIMER_PENDING, Ordering::Release);
                return;
            }
            STATE_TIMER_PENDING_CALLS_ACTIVE => {
                // Release publishes last_quiet so a firing timer can re-arm
                // from the right instant.
                match inner.state.compare_exchange_weak(
                    state,
                    STATE_TIMER_PENDING_CALLS_SEEN,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => state = observed,
                }
            }
            _ => {
                backoff(&mut spins);
                state = inner.state.load(Ordering::Relaxed);
            }
        }
    }
}

fn timer_fired(inner: &Arc<IdleInner>) {
    let mut spins = 0u32;
    let mut state = inner.state.load(Ordering::Relaxed);
    loop {
        match state {
            STATE_TIMER_PENDING => {
                // Processing blocks arrivals until the notification is out,
                // so a racing call cannot observe a half-entered idle.
                match inner.state.compare_exchange_weak(
                    state,
                    STATE_PROCESSING,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        tracing::debug!("channel entered idle");
                        (inner.on_idle)();
                        inner.state.store(STATE_IDLE, Ordering::Relaxed);
                        return;
                    }
                    Err(observed) => state = observed,
                }
            }
            STATE_TIMER_PENDING_CALLS_ACTIVE => {
                // Timer deliberately dropped; the next departure re-arms it.
                // Nothing shared is published on this edge, so relaxed is
                // enough.
                match inner.state.compare_exchange_weak(
                    state,
                    STATE_CALLS_ACTIVE,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => state = observed,
                }
            }
            STATE_TIMER_PENDING_CALLS_SEEN => {
                // Processing blocks arrivals so a disconnect cannot slip in
                // between the re-arm and the state store.
                match inner.state.compare_exchange_weak(
                    state,
                    STATE_PROCESSING,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        arm_timer(inner);
                        inner.state.store(STATE_TIMER_PENDING, Ordering::Relaxed);
                        return;
                    }
                    Err(observed) => state = observed,
                }
            }
            _ => {
                backoff(&mut spins);
                state = inner.state.load(Ordering::Relaxed);
            }
        }
    }
}

fn arm_timer(inner: &Arc<IdleInner>) {
    // Exclusive by construction: only the settling thread reaches here.
    let deadline = unsafe { *inner.last_quiet.get() } + inner.timeout;
    let callback_inner = Arc::clone(inner);
    let handle = inner
        .engine
        .run_at(deadline, move || timer_fired(&callback_inner));
    *inner.timer.lock().unwrap() = Some(handle);
    tracing::debug!("idle timer armed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::engine::Engine;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn tracker(engine: &Engine) -> (IdleTracker, Arc<AtomicUsize>) {
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        let tracker = IdleTracker::new(engine.handle(), TIMEOUT, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (tracker, events)
    }

    #[test]
    fn test_single_quiet_span_emits_once() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.increase_call_count();
        tracker.decrease_call_count();
        std::thread::sleep(TIMEOUT + Duration::from_millis(150));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.active_calls(), 0);
        assert_eq!(tracker.state(), IdleState::Idle);
        // No second event without further activity.
        std::thread::sleep(TIMEOUT + Duration::from_millis(100));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_event_while_calls_active() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.increase_call_count();
        std::thread::sleep(TIMEOUT + Duration::from_millis(100));
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.state(), IdleState::CallsActive);
        tracker.decrease_call_count();
        std::thread::sleep(TIMEOUT + Duration::from_millis(150));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arrival_during_pending_timer_defers_idle() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.increase_call_count();
        tracker.decrease_call_count();
        // A new call before the timer fires invalidates it.
        tracker.increase_call_count();
        assert_eq!(tracker.state(), IdleState::TimerPendingCallsActive);
        std::thread::sleep(TIMEOUT + Duration::from_millis(150));
        assert_eq!(events.load(Ordering::SeqCst), 0);
        tracker.decrease_call_count();
        std::thread::sleep(TIMEOUT + Duration::from_millis(150));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quick_call_pair_rearms_from_latest_quiet_point() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.increase_call_count();
        tracker.decrease_call_count();
        tracker.increase_call_count();
        tracker.decrease_call_count();
        assert_eq!(tracker.state(), IdleState::TimerPendingCallsSeen);
        // First firing re-arms; the second firing enters idle.
        std::thread::sleep(2 * TIMEOUT + Duration::from_millis(300));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_suppresses_idle() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.increase_call_count();
        tracker.decrease_call_count();
        tracker.disconnect();
        std::thread::sleep(2 * TIMEOUT + Duration::from_millis(200));
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert!(tracker.active_calls() >= 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, events) = tracker(&engine);
        tracker.disconnect();
        tracker.disconnect();
        std::thread::sleep(TIMEOUT + Duration::from_millis(100));
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_counter_conservation_under_contention() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let (tracker, _events) = tracker(&engine);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.increase_call_count();
                        tracker.decrease_call_count();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.active_calls(), 0);
        tracker.disconnect();
    }
}
