//! Re-entrant CAS spinlock (replaces spinlock.h)
//!
//! `lock` holds the owner's thread id (0 = unlocked) and `nest` the recursion
//! depth. Both are read and written as a pair only while `sync_lock` is held;
//! `sync_lock` is never held across the outer spin.
//!
//! Contending threads never park: they retry the CAS and call the lock's
//! [`YieldPolicy`] between attempts.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};

use super::atomic::{
    interlocked_compare_exchange, interlocked_decrement, interlocked_exchange,
    interlocked_increment,
};
use crate::thread;

/// What a spinning thread does between CAS attempts.
pub trait YieldPolicy {
    fn yield_now(&self);
}

/// Yields to the OS scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsYield;

impl YieldPolicy for OsYield {
    #[inline]
    fn yield_now(&self) {
        thread::yield_now();
    }
}

#[repr(align(64))]
pub struct SpinLock<Y = OsYield> {
    lock: AtomicI32,
    nest: AtomicI32,
    sync_lock: AtomicI32,
    yielder: Y,
}

impl SpinLock<OsYield> {
    pub const fn new() -> Self {
        Self::with_yield(OsYield)
    }
}

impl Default for SpinLock<OsYield> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Y: YieldPolicy> SpinLock<Y> {
    pub const fn with_yield(yielder: Y) -> Self {
        Self {
            lock: AtomicI32::new(0),
            nest: AtomicI32::new(0),
            sync_lock: AtomicI32::new(0),
            yielder,
        }
    }

    /// Reset to the unlocked state. Must not be called while any thread
    /// holds or waits for the lock.
    pub fn initialize(&self) {
        self.lock.store(0, Ordering::SeqCst);
        self.nest.store(0, Ordering::SeqCst);
        self.sync_lock.store(0, Ordering::SeqCst);
    }

    /// Nothing to release; no OS resources are held.
    pub fn finalize(&self) {}

    fn get_sync_lock(&self) {
        while interlocked_compare_exchange(&self.sync_lock, 1, 0) != 0 {
            self.yielder.yield_now();
        }
    }

    fn drop_sync_lock(&self) {
        interlocked_exchange(&self.sync_lock, 0);
    }

    /// Acquire for the calling thread.
    pub fn enter(&self) {
        self.enter_as(thread::current_tid());
    }

    /// Acquire on behalf of `tid` (nonzero).
    pub fn enter_as(&self, tid: i32) {
        debug_assert_ne!(tid, 0, "tid 0 means unlocked");

        // Already ours? Bump the nesting level.
        self.get_sync_lock();
        if interlocked_compare_exchange(&self.lock, tid, tid) == tid {
            interlocked_increment(&self.nest);
            self.drop_sync_lock();
            return;
        }
        self.drop_sync_lock();

        loop {
            if interlocked_compare_exchange(&self.lock, tid, 0) == 0 {
                interlocked_increment(&self.nest);
                return;
            }
            self.yielder.yield_now();
        }
    }

    /// One acquisition attempt without spinning on the outer lock.
    pub fn try_enter_as(&self, tid: i32) -> bool {
        debug_assert_ne!(tid, 0, "tid 0 means unlocked");

        self.get_sync_lock();
        let acquired = match interlocked_compare_exchange(&self.lock, tid, 0) {
            0 => true,
            owner => owner == tid,
        };
        if acquired {
            interlocked_increment(&self.nest);
        }
        self.drop_sync_lock();
        acquired
    }

    pub fn try_enter(&self) -> bool {
        self.try_enter_as(thread::current_tid())
    }

    /// Release one nesting level for the calling thread.
    pub fn leave(&self) {
        self.leave_as(thread::current_tid());
    }

    /// Release one nesting level held by `tid`. A non-owner is ignored.
    pub fn leave_as(&self, tid: i32) {
        self.get_sync_lock();
        if interlocked_compare_exchange(&self.lock, tid, tid) == tid {
            if interlocked_decrement(&self.nest) == 0 {
                interlocked_exchange(&self.lock, 0);
            }
        } else {
            tracing::trace!("[sync] [spinlock] leave by non-owner tid={} ignored", tid);
        }
        self.drop_sync_lock();
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, Y> {
        let tid = thread::current_tid();
        self.enter_as(tid);
        SpinLockGuard {
            lock: self,
            tid,
            _not_send: PhantomData,
        }
    }

    /// Owner thread id, `None` when unlocked.
    pub fn owner(&self) -> Option<i32> {
        match self.lock.load(Ordering::SeqCst) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Current nesting depth (0 when unlocked).
    pub fn depth(&self) -> i32 {
        self.nest.load(Ordering::SeqCst)
    }
}

/// Releases one nesting level of a [`SpinLock`] on drop.
///
/// Not `Send`: the release must come from the acquiring thread.
pub struct SpinLockGuard<'a, Y: YieldPolicy = OsYield> {
    lock: &'a SpinLock<Y>,
    tid: i32,
    _not_send: PhantomData<*const ()>,
}

impl<Y: YieldPolicy> Drop for SpinLockGuard<'_, Y> {
    fn drop(&mut self) {
        self.lock.leave_as(self.tid);
    }
}
