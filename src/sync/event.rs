//! Event-emulated condition variable backend.
//!
//! For targets without native condition variables. A condition is two events
//! plus a waiter count guarded by its own lock:
//!
//! - `SIGNAL` is auto-reset: consuming it wakes exactly one waiter.
//! - `BROADCAST` is manual-reset: it stays set until the last waiter woken by
//!   it resets it.
//!
//! An event set while nobody waits stays set, so the next waiter returns
//! immediately. Callers re-check their predicate anyway.

use std::time::{Duration, Instant};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex};

use super::mutex::{RawCond, RawMutex, SyncBackend, SyncError, WaitResult};

pub struct EventBackend;

impl SyncBackend for EventBackend {
    type Mutex = EventMutex;
    type Cond = EventCond;

    const NAME: &'static str = "event";
}

pub struct EventMutex {
    raw: parking_lot::RawMutex,
}

impl RawMutex for EventMutex {
    fn try_new() -> Result<Self, SyncError> {
        Ok(Self {
            raw: parking_lot::RawMutex::INIT,
        })
    }

    fn lock(&self) {
        self.raw.lock();
    }

    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    unsafe fn unlock(&self) {
        // SAFETY: caller holds the lock.
        unsafe { self.raw.unlock() }
    }
}

pub(crate) const EVENT_SIGNAL: usize = 0;
pub(crate) const EVENT_BROADCAST: usize = 1;

/// The two events of one condition, waited on together.
struct EventPair {
    state: Mutex<[bool; 2]>,
    cv: Condvar,
}

impl EventPair {
    fn new() -> Self {
        Self {
            state: Mutex::new([false; 2]),
            cv: Condvar::new(),
        }
    }

    fn set(&self, which: usize) {
        let mut state = self.state.lock();
        state[which] = true;
        self.cv.notify_all();
    }

    fn reset(&self, which: usize) {
        self.state.lock()[which] = false;
    }

    #[cfg(test)]
    fn is_set(&self, which: usize) -> bool {
        self.state.lock()[which]
    }

    /// Wait until either event is set. Returns which one, or `None` on
    /// timeout. Consuming `SIGNAL` clears it.
    fn wait_any(&self, timeout: Option<Duration>) -> Option<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state[EVENT_SIGNAL] {
                state[EVENT_SIGNAL] = false;
                return Some(EVENT_SIGNAL);
            }
            if state[EVENT_BROADCAST] {
                return Some(EVENT_BROADCAST);
            }
            match deadline {
                None => self.cv.wait(&mut state),
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return None;
                    }
                }
            }
        }
    }
}

pub struct EventCond {
    events: EventPair,
    waiters: Mutex<u32>,
}

impl EventCond {
    #[cfg(test)]
    fn broadcast_pending(&self) -> bool {
        self.events.is_set(EVENT_BROADCAST)
    }

    #[cfg(test)]
    fn waiter_count(&self) -> u32 {
        *self.waiters.lock()
    }
}

impl RawCond for EventCond {
    type Mutex = EventMutex;

    fn try_new() -> Result<Self, SyncError> {
        Ok(Self {
            events: EventPair::new(),
            waiters: Mutex::new(0),
        })
    }

    unsafe fn wait(&self, mutex: &EventMutex, timeout: Option<Duration>) -> WaitResult {
        *self.waiters.lock() += 1;

        // Events keep their state, so nothing set between here and the wait
        // is lost.
        // SAFETY: caller holds mutex.
        unsafe { mutex.unlock() };

        let woken_by = self.events.wait_any(timeout);

        let is_last = {
            let mut waiters = self.waiters.lock();
            *waiters -= 1;
            woken_by == Some(EVENT_BROADCAST) && *waiters == 0
        };
        if is_last {
            self.events.reset(EVENT_BROADCAST);
        }

        mutex.lock();

        match woken_by {
            Some(_) => WaitResult::Signaled,
            None => WaitResult::TimedOut,
        }
    }

    fn signal(&self) {
        self.events.set(EVENT_SIGNAL);
    }

    fn broadcast(&self) {
        self.events.set(EVENT_BROADCAST);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_event_pair_signal_is_auto_reset() {
        let ev = EventPair::new();
        ev.set(EVENT_SIGNAL);
        assert_eq!(ev.wait_any(Some(Duration::ZERO)), Some(EVENT_SIGNAL));
        assert!(!ev.is_set(EVENT_SIGNAL));
        assert_eq!(ev.wait_any(Some(Duration::from_millis(5))), None);
    }

    #[test]
    fn test_event_pair_broadcast_is_manual_reset() {
        let ev = EventPair::new();
        ev.set(EVENT_BROADCAST);
        assert_eq!(ev.wait_any(Some(Duration::ZERO)), Some(EVENT_BROADCAST));
        assert_eq!(ev.wait_any(Some(Duration::ZERO)), Some(EVENT_BROADCAST));
        ev.reset(EVENT_BROADCAST);
        assert_eq!(ev.wait_any(Some(Duration::ZERO)), None);
    }

    #[test]
    fn test_signal_wakes_only_one() {
        let m = Arc::new(EventMutex::try_new().unwrap());
        let c = Arc::new(EventCond::try_new().unwrap());
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let (m, c, woken) = (Arc::clone(&m), Arc::clone(&c), Arc::clone(&woken));
                std::thread::spawn(move || {
                    m.lock();
                    let r = unsafe { c.wait(&m, Some(Duration::from_millis(300))) };
                    if r == WaitResult::Signaled {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                    unsafe { m.unlock() };
                })
            })
            .collect();

        while c.waiter_count() < 3 {
            std::thread::yield_now();
        }
        c.signal();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_broadcast_waiter_resets_event() {
        let m = Arc::new(EventMutex::try_new().unwrap());
        let c = Arc::new(EventCond::try_new().unwrap());

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let (m, c) = (Arc::clone(&m), Arc::clone(&c));
                std::thread::spawn(move || {
                    m.lock();
                    let r = unsafe { c.wait(&m, None) };
                    unsafe { m.unlock() };
                    r
                })
            })
            .collect();

        while c.waiter_count() < 3 {
            std::thread::yield_now();
        }
        c.broadcast();
        for h in handles {
            assert_eq!(h.join().unwrap(), WaitResult::Signaled);
        }
        assert_eq!(c.waiter_count(), 0);
        assert!(!c.broadcast_pending());
    }
}
