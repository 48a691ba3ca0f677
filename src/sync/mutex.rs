//! Mutex and condition variable (replaces mutex.c)
//!
//! One API over interchangeable backends. [`NativeBackend`] is pthreads on
//! unix and the event-based emulation everywhere else; both can be named
//! explicitly, e.g. `Mutex::<EventBackend>::create()`.

use std::marker::PhantomData;
use std::time::Duration;

#[cfg(unix)]
pub use super::pthread::PthreadBackend;
pub use super::event::EventBackend;

#[cfg(unix)]
pub type NativeBackend = PthreadBackend;
#[cfg(not(unix))]
pub type NativeBackend = EventBackend;

/// Error types for native primitive creation
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{op} failed with code {code}")]
    Native { op: &'static str, code: i32 },
}

/// Outcome of a condition wait. Either way the caller re-checks its predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl WaitResult {
    pub fn timed_out(&self) -> bool {
        matches!(self, WaitResult::TimedOut)
    }
}

pub trait RawMutex: Send + Sync + Sized {
    fn try_new() -> Result<Self, SyncError>;
    fn lock(&self);
    fn try_lock(&self) -> bool;

    /// # Safety
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self);
}

pub trait RawCond: Send + Sync + Sized {
    type Mutex: RawMutex;

    fn try_new() -> Result<Self, SyncError>;

    /// Release `mutex`, wait for a wakeup or the timeout, reacquire `mutex`.
    ///
    /// # Safety
    /// The calling thread must hold `mutex`.
    unsafe fn wait(&self, mutex: &Self::Mutex, timeout: Option<Duration>) -> WaitResult;

    fn signal(&self);
    fn broadcast(&self);
}

/// A family of threading primitives selected together.
pub trait SyncBackend: 'static {
    type Mutex: RawMutex;
    type Cond: RawCond<Mutex = Self::Mutex>;

    const NAME: &'static str;
}

fn fatal(what: &str, backend: &str, e: SyncError) -> ! {
    tracing::error!("[sync] [fatal] {} create failed (backend={}): {}", what, backend, e);
    std::process::abort();
}

/// Convert reference-style "ticks" (milliseconds, negative = forever).
pub fn ticks_to_timeout(timeout_ticks: i64) -> Option<Duration> {
    u64::try_from(timeout_ticks).ok().map(Duration::from_millis)
}

pub struct Mutex<B: SyncBackend = NativeBackend> {
    raw: B::Mutex,
}

impl<B: SyncBackend> Mutex<B> {
    pub fn try_create() -> Result<Self, SyncError> {
        Ok(Self {
            raw: B::Mutex::try_new()?,
        })
    }

    /// Create a mutex; a native failure is fatal and aborts the process.
    pub fn create() -> Self {
        Self::try_create().unwrap_or_else(|e| fatal("mutex", B::NAME, e))
    }

    pub fn destroy(self) {}

    pub fn lock(&self) {
        self.raw.lock();
    }

    pub fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    /// # Safety
    /// The calling thread must hold the lock.
    pub unsafe fn unlock(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.raw.unlock() }
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> MutexGuard<'_, B> {
        self.raw.lock();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_guard(&self) -> Option<MutexGuard<'_, B>> {
        self.raw.try_lock().then(|| MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

impl<B: SyncBackend> Default for Mutex<B> {
    fn default() -> Self {
        Self::create()
    }
}

pub struct MutexGuard<'a, B: SyncBackend = NativeBackend> {
    mutex: &'a Mutex<B>,
    _not_send: PhantomData<*const ()>,
}

impl<B: SyncBackend> Drop for MutexGuard<'_, B> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the lock.
        unsafe { self.mutex.raw.unlock() }
    }
}

pub struct Cond<B: SyncBackend = NativeBackend> {
    raw: B::Cond,
}

impl<B: SyncBackend> Cond<B> {
    pub fn try_create() -> Result<Self, SyncError> {
        Ok(Self {
            raw: B::Cond::try_new()?,
        })
    }

    /// Create a condition variable; a native failure aborts the process.
    pub fn create() -> Self {
        Self::try_create().unwrap_or_else(|e| fatal("cond", B::NAME, e))
    }

    pub fn destroy(self) {}

    /// Wait on the mutex held through `guard`. Negative `timeout_ticks`
    /// waits forever, otherwise it is a relative timeout in milliseconds.
    pub fn wait(&self, guard: &mut MutexGuard<'_, B>, timeout_ticks: i64) -> WaitResult {
        // SAFETY: the guard proves the mutex is held by this thread.
        unsafe {
            self.raw
                .wait(&guard.mutex.raw, ticks_to_timeout(timeout_ticks))
        }
    }

    /// Wait on a mutex locked with [`Mutex::lock`].
    ///
    /// # Safety
    /// The calling thread must hold `mutex`.
    pub unsafe fn wait_raw(&self, mutex: &Mutex<B>, timeout_ticks: i64) -> WaitResult {
        // SAFETY: forwarded to the caller.
        unsafe { self.raw.wait(&mutex.raw, ticks_to_timeout(timeout_ticks)) }
    }

    /// Wake at most one waiter.
    pub fn signal(&self) {
        self.raw.signal();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.raw.broadcast();
    }
}

impl<B: SyncBackend> Default for Cond<B> {
    fn default() -> Self {
        Self::create()
    }
}
