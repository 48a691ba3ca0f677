//! POSIX backend: thin wrappers over pthread mutexes and condition variables.

use std::cell::UnsafeCell;
use std::time::Duration;

use super::mutex::{RawCond, RawMutex, SyncBackend, SyncError, WaitResult};

pub struct PthreadBackend;

impl SyncBackend for PthreadBackend {
    type Mutex = PthreadMutex;
    type Cond = PthreadCond;

    const NAME: &'static str = "pthread";
}

/// Boxed so the native object never moves after `pthread_mutex_init`.
pub struct PthreadMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: pthread mutexes are designed to be shared between threads; all
// access goes through the pthread API.
unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl RawMutex for PthreadMutex {
    fn try_new() -> Result<Self, SyncError> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        // SAFETY: inner points to writable, pinned storage.
        let rc = unsafe { libc::pthread_mutex_init(inner.get(), std::ptr::null()) };
        if rc != 0 {
            return Err(SyncError::Native {
                op: "pthread_mutex_init",
                code: rc,
            });
        }
        Ok(Self { inner })
    }

    fn lock(&self) {
        // SAFETY: initialised in try_new, destroyed only in Drop.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock");
    }

    fn try_lock(&self) -> bool {
        // SAFETY: see lock.
        unsafe { libc::pthread_mutex_trylock(self.inner.get()) == 0 }
    }

    unsafe fn unlock(&self) {
        // SAFETY: caller holds the lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock");
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        // SAFETY: no guard can outlive the mutex, so nobody holds it here.
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
    }
}

pub struct PthreadCond {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

// SAFETY: as for PthreadMutex.
unsafe impl Send for PthreadCond {}
unsafe impl Sync for PthreadCond {}

/// Absolute CLOCK_REALTIME deadline `timeout` from now.
fn deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid out pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }

    let total_nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as i64)
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX))
        .saturating_add(total_nsec / 1_000_000_000);

    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: (total_nsec % 1_000_000_000) as libc::c_long,
    }
}

impl RawCond for PthreadCond {
    type Mutex = PthreadMutex;

    fn try_new() -> Result<Self, SyncError> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        // SAFETY: inner points to writable, pinned storage.
        let rc = unsafe { libc::pthread_cond_init(inner.get(), std::ptr::null()) };
        if rc != 0 {
            return Err(SyncError::Native {
                op: "pthread_cond_init",
                code: rc,
            });
        }
        Ok(Self { inner })
    }

    unsafe fn wait(&self, mutex: &PthreadMutex, timeout: Option<Duration>) -> WaitResult {
        match timeout {
            None => {
                // SAFETY: caller holds mutex.
                unsafe { libc::pthread_cond_wait(self.inner.get(), mutex.inner.get()) };
                WaitResult::Signaled
            }
            Some(timeout) => {
                let ts = deadline(timeout);
                // SAFETY: caller holds mutex; ts outlives the call.
                let rc = unsafe {
                    libc::pthread_cond_timedwait(self.inner.get(), mutex.inner.get(), &ts)
                };
                if rc == libc::ETIMEDOUT {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Signaled
                }
            }
        }
    }

    fn signal(&self) {
        // SAFETY: initialised in try_new.
        unsafe {
            libc::pthread_cond_signal(self.inner.get());
        }
    }

    fn broadcast(&self) {
        // SAFETY: initialised in try_new.
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

impl Drop for PthreadCond {
    fn drop(&mut self) {
        // SAFETY: no waiter can hold a borrow of self here.
        unsafe {
            libc::pthread_cond_destroy(self.inner.get());
        }
    }
}
