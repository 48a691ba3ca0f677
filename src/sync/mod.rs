//! Low-level synchronization primitives
//!
//! - `atomic`: Interlocked-style CAS / increment / exchange facade
//! - `spinlock`: re-entrant CAS spinlock built on the facade
//! - `mutex`: mutex + condition variable behind a backend trait

pub mod atomic;
mod event;
pub mod mutex;
#[cfg(unix)]
mod pthread;
pub mod spinlock;

pub use mutex::{Cond, Mutex, MutexGuard, NativeBackend, SyncBackend, SyncError, WaitResult};
pub use spinlock::{OsYield, SpinLock, SpinLockGuard, YieldPolicy};
