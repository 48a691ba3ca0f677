//! Thread table (replaces thread.c)
//!
//! Threads are tracked in a fixed-capacity arena owned by a [`ThreadManager`].
//! Handles are `(slot, generation)` pairs, so a handle kept after its thread
//! finished and the slot was reused is rejected instead of aliasing the new
//! thread.
//!
//! Slot 0 always represents the thread that created the manager (the process
//! main thread in a server binary).

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::ThreadConfig;
use crate::sync::atomic::interlocked_increment;

/// Maximum number of threads per manager.
pub const THREADS_MAX: usize = 64;

/// Stack size used by [`ThreadManager::create`] (8MB).
pub const DEFAULT_STACK_SIZE: usize = 1 << 23;

/// Value returned by a thread's entry point.
pub type ExitCode = usize;

/// Error types for thread operations
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("No free thread slot (capacity: {capacity})")]
    NoFreeSlot { capacity: usize },

    #[error("Failed to spawn native thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Stale thread handle: id={id}")]
    StaleHandle { id: usize },

    #[error("Thread not joinable: id={id}")]
    NotJoinable { id: usize },

    #[error("Thread panicked: id={id}")]
    Panicked { id: usize },

    #[error("Thread did not stop within {grace:?}: id={id}")]
    DestroyTimeout { id: usize, grace: Duration },
}

/// Scheduler priority recorded for a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl ThreadPriority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadPriority::Low,
            2 => ThreadPriority::High,
            _ => ThreadPriority::Normal,
        }
    }
}

/// Index handle into a [`ThreadManager`] slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    id: usize,
    generation: u32,
}

impl ThreadHandle {
    /// Slot index of this thread.
    pub fn id(&self) -> usize {
        self.id
    }
}

/// Passed to every entry point.
pub struct ThreadContext {
    handle: ThreadHandle,
    cancel: Arc<AtomicBool>,
}

impl ThreadContext {
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// True once [`ThreadManager::destroy`] was called for this thread.
    /// Long-running entry points must poll this.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

struct Slot {
    generation: AtomicU32,
    /// Set while an entry point is bound to the slot (the slot is "used").
    occupied: AtomicBool,
    prio: AtomicU8,
    cancel: Mutex<Arc<AtomicBool>>,
    native: Mutex<Option<JoinHandle<ExitCode>>>,
    native_id: Mutex<Option<ThreadId>>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            occupied: AtomicBool::new(false),
            prio: AtomicU8::new(ThreadPriority::Normal as u8),
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            native: Mutex::new(None),
            native_id: Mutex::new(None),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        }
    }
}

struct Table {
    key: usize,
    slots: Box<[Slot]>,
    default_stack_size: usize,
    destroy_grace: Duration,
}

impl Table {
    fn slot(&self, handle: ThreadHandle) -> Result<&Slot, ThreadError> {
        let slot = self
            .slots
            .get(handle.id)
            .ok_or(ThreadError::StaleHandle { id: handle.id })?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return Err(ThreadError::StaleHandle { id: handle.id });
        }
        Ok(slot)
    }

    /// Called by the trampoline when the entry point returns (or unwinds).
    /// Keeps the join handle and native id so a pending `wait` still works.
    fn terminated(&self, id: usize) {
        let slot = &self.slots[id];
        // A fast entry point must not free the slot before `create_ex`
        // has stored its join handle.
        drop(slot.native.lock());
        slot.prio.store(ThreadPriority::Normal as u8, Ordering::Release);
        {
            let mut finished = slot.finished.lock();
            *finished = true;
            slot.finished_cv.notify_all();
        }
        slot.occupied.store(false, Ordering::Release);
    }
}

static NEXT_TABLE_KEY: AtomicUsize = AtomicUsize::new(1);
static NEXT_TID: AtomicI32 = AtomicI32::new(0);

thread_local! {
    /// (table key, slot id) of the managed thread running here.
    static CURRENT_SLOT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    static CURRENT_TID: Cell<i32> = const { Cell::new(0) };
}

/// Process-unique, nonzero id of the calling thread.
///
/// Assigned lazily on first use. Unlike slot ids this also covers threads
/// the manager did not spawn, which is what lock ownership needs.
pub fn current_tid() -> i32 {
    CURRENT_TID.with(|tid| {
        if tid.get() == 0 {
            tid.set(interlocked_increment(&NEXT_TID));
        }
        tid.get()
    })
}

/// Gives the rest of the time slice back to the OS scheduler.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

/// OS page size; stack sizes are rounded up to a multiple of it.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

/// Round `stack_size` up to the page size (at least one page).
pub fn align_stack_size(stack_size: usize) -> usize {
    let page = page_size();
    stack_size.max(1).div_ceil(page) * page
}

#[cfg(unix)]
fn block_worker_signals() {
    // Threads inherit the spawner's mask; signals are handled on the main
    // thread only.
    // SAFETY: `set` is initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in crate::core::Signal::WORKER_BLOCKED {
            libc::sigaddset(&mut set, sig.signal_num());
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_worker_signals() {}

struct SlotRelease {
    table: Arc<Table>,
    id: usize,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.table.terminated(self.id);
    }
}

/// Owner of the thread slot table.
#[derive(Clone)]
pub struct ThreadManager {
    table: Arc<Table>,
}

impl ThreadManager {
    /// Create a manager with the default limits; the caller becomes slot 0.
    pub fn new() -> Self {
        Self::with_config(&ThreadConfig::default())
    }

    pub fn with_config(config: &ThreadConfig) -> Self {
        let capacity = config.max_threads.max(1);
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();
        let table = Arc::new(Table {
            key: NEXT_TABLE_KEY.fetch_add(1, Ordering::Relaxed),
            slots: slots.into_boxed_slice(),
            default_stack_size: config.stack_size,
            destroy_grace: Duration::from_millis(config.destroy_grace_ms),
        });

        // Slot 0 is the creating thread
        let main = &table.slots[0];
        main.occupied.store(true, Ordering::Release);
        *main.native_id.lock() = Some(std::thread::current().id());
        CURRENT_SLOT.with(|s| s.set(Some((table.key, 0))));

        tracing::debug!("[thread] [init] capacity={}", capacity);
        Self { table }
    }

    pub fn capacity(&self) -> usize {
        self.table.slots.len()
    }

    /// Number of slots currently bound to a thread (including slot 0).
    pub fn active_count(&self) -> usize {
        self.table
            .slots
            .iter()
            .filter(|s| s.occupied.load(Ordering::Acquire))
            .count()
    }

    /// Spawn with the configured stack size and normal priority.
    pub fn create<F>(&self, entry: F) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(&ThreadContext) -> ExitCode + Send + 'static,
    {
        self.create_ex(entry, self.table.default_stack_size, ThreadPriority::Normal)
    }

    pub fn create_ex<F>(
        &self,
        entry: F,
        stack_size: usize,
        prio: ThreadPriority,
    ) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce(&ThreadContext) -> ExitCode + Send + 'static,
    {
        let stack_size = align_stack_size(stack_size);

        let Some(id) = self.reserve_slot() else {
            tracing::error!(
                "[thread] [create] cannot create new thread - no free thread slot found (capacity={})",
                self.capacity()
            );
            return Err(ThreadError::NoFreeSlot {
                capacity: self.capacity(),
            });
        };

        let slot = &self.table.slots[id];
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let handle = ThreadHandle { id, generation };
        let cancel = Arc::new(AtomicBool::new(false));
        *slot.cancel.lock() = Arc::clone(&cancel);
        *slot.finished.lock() = false;
        slot.prio.store(prio as u8, Ordering::Release);

        let ctx = ThreadContext { handle, cancel };
        let table = Arc::clone(&self.table);
        // Held until the join handle is stored; `terminated` waits on it.
        let mut native = slot.native.lock();
        let spawned = std::thread::Builder::new()
            .name(format!("worker-{}", id))
            .stack_size(stack_size)
            .spawn(move || {
                let key = table.key;
                let _release = SlotRelease { table, id };
                CURRENT_SLOT.with(|s| s.set(Some((key, id))));
                block_worker_signals();
                entry(&ctx)
            });

        match spawned {
            Ok(join) => {
                *slot.native_id.lock() = Some(join.thread().id());
                *native = Some(join);
                tracing::debug!(
                    "[thread] [create] id={} stack={} prio={:?}",
                    id,
                    stack_size,
                    prio
                );
                Ok(handle)
            }
            Err(e) => {
                tracing::error!("[thread] [create] spawn failed id={}: {}", id, e);
                slot.prio.store(ThreadPriority::Normal as u8, Ordering::Release);
                slot.occupied.store(false, Ordering::Release);
                Err(ThreadError::Spawn(e))
            }
        }
    }

    fn reserve_slot(&self) -> Option<usize> {
        self.table.slots.iter().position(|s| {
            s.occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Cancel the thread and reclaim it.
    ///
    /// The entry point sees [`ThreadContext::is_cancelled`]; once it returns
    /// the thread is joined and the slot is free. If it does not return
    /// within the configured grace period the thread is left running with
    /// its slot still reserved, and `DestroyTimeout` is returned.
    pub fn destroy(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        if handle.id == 0 {
            return Err(ThreadError::NotJoinable { id: 0 });
        }
        let slot = self.table.slot(handle)?;
        let current = || slot.generation.load(Ordering::Acquire) == handle.generation;
        {
            // `create_ex` swaps the flag under this lock after bumping the generation
            let cancel = slot.cancel.lock();
            if !current() {
                return Err(ThreadError::StaleHandle { id: handle.id });
            }
            cancel.store(true, Ordering::Release);
        }

        let grace = self.table.destroy_grace;
        let finished = {
            let mut finished = slot.finished.lock();
            slot.finished_cv
                .wait_while_for(&mut finished, |done| !*done && current(), grace);
            *finished || !current()
        };

        if !finished {
            tracing::warn!(
                "[thread] [destroy] id={} ignored cancellation for {:?}",
                handle.id,
                grace
            );
            return Err(ThreadError::DestroyTimeout {
                id: handle.id,
                grace,
            });
        }

        let join = {
            let mut native = slot.native.lock();
            // A reused slot means our thread already ended and its handle was dropped
            if !current() {
                return Ok(());
            }
            native.take()
        };
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("[thread] [destroy] id={} panicked", handle.id);
                return Err(ThreadError::Panicked { id: handle.id });
            }
        }
        tracing::debug!("[thread] [destroy] id={}", handle.id);
        Ok(())
    }

    /// Block until the thread finishes and return its exit code.
    pub fn wait(&self, handle: ThreadHandle) -> Result<ExitCode, ThreadError> {
        let slot = self.table.slot(handle)?;
        let join = slot
            .native
            .lock()
            .take()
            .ok_or(ThreadError::NotJoinable { id: handle.id })?;

        join.join().map_err(|_| {
            tracing::error!("[thread] [wait] id={} panicked", handle.id);
            ThreadError::Panicked { id: handle.id }
        })
    }

    /// Handle of the calling thread, if this manager runs it.
    pub fn current(&self) -> Option<ThreadHandle> {
        let via_tls = CURRENT_SLOT.with(|s| s.get());
        if let Some((key, id)) = via_tls {
            if key == self.table.key {
                let slot = &self.table.slots[id];
                if slot.occupied.load(Ordering::Acquire) {
                    return Some(ThreadHandle {
                        id,
                        generation: slot.generation.load(Ordering::Acquire),
                    });
                }
                return None;
            }
        }
        self.find_by_native(std::thread::current().id())
    }

    /// Slot id of the calling thread, -1 when unmanaged.
    pub fn current_id(&self) -> isize {
        self.current().map(|h| h.id as isize).unwrap_or(-1)
    }

    /// Linear scan of the table by native thread id.
    pub fn find_by_native(&self, native: ThreadId) -> Option<ThreadHandle> {
        self.table.slots.iter().enumerate().find_map(|(id, slot)| {
            let matches = slot.occupied.load(Ordering::Acquire)
                && *slot.native_id.lock() == Some(native);
            matches.then(|| ThreadHandle {
                id,
                generation: slot.generation.load(Ordering::Acquire),
            })
        })
    }

    pub fn is_running(&self, handle: ThreadHandle) -> bool {
        self.table
            .slot(handle)
            .map(|s| s.occupied.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Record the scheduler priority for a thread.
    ///
    /// Only stored; the OS scheduler is not adjusted.
    pub fn prio_set(&self, handle: ThreadHandle, prio: ThreadPriority) -> Result<(), ThreadError> {
        let slot = self.table.slot(handle)?;
        slot.prio.store(prio as u8, Ordering::Release);
        Ok(())
    }

    pub fn prio_get(&self, handle: ThreadHandle) -> Result<ThreadPriority, ThreadError> {
        let slot = self.table.slot(handle)?;
        Ok(ThreadPriority::from_u8(slot.prio.load(Ordering::Acquire)))
    }

    /// Destroy every thread still bound to a slot (slot 0 excluded).
    pub fn shutdown(&self) {
        for (id, slot) in self.table.slots.iter().enumerate().skip(1) {
            if !slot.occupied.load(Ordering::Acquire) {
                continue;
            }
            let handle = ThreadHandle {
                id,
                generation: slot.generation.load(Ordering::Acquire),
            };
            tracing::warn!(
                "[thread] [final] unterminated thread id={} - forcing to terminate",
                id
            );
            if let Err(e) = self.destroy(handle) {
                tracing::error!("[thread] [final] id={}: {}", id, e);
            }
        }
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}
