//! Exclusion between collections and mutator threads.
//!
//! Mutators that must not observe a collection (object construction off the
//! main thread, for instance) hold an async lock for the duration. Any number
//! of async locks may be held at once; the GC lock is exclusive and waits for
//! every async lock to be released. New async locks wait while a collection
//! holds the GC lock.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    async_counter: usize,
    gc_locked: bool,
}

#[derive(Debug, Default)]
pub struct GcSyncObject {
    state: Mutex<LockState>,
    changed: Condvar,
    collecting: AtomicBool,
}

impl GcSyncObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no collection is running, then register an async holder.
    pub fn lock_async(&self) -> AsyncLockGuard<'_> {
        let mut state = self.state.lock();
        while state.gc_locked {
            self.changed.wait(&mut state);
        }
        state.async_counter += 1;
        AsyncLockGuard { sync: self }
    }

    fn unlock_async(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.async_counter > 0, "unbalanced async unlock");
        state.async_counter = state.async_counter.saturating_sub(1);
        if state.async_counter == 0 {
            self.changed.notify_all();
        }
    }

    /// Acquire the GC lock, waiting for other collections and async holders.
    pub fn gc_lock(&self) -> GcLockGuard<'_> {
        let mut state = self.state.lock();
        while state.gc_locked {
            self.changed.wait(&mut state);
        }
        state.gc_locked = true;
        while state.async_counter > 0 {
            self.changed.wait(&mut state);
        }
        GcLockGuard { sync: self }
    }

    /// Acquire the GC lock only if nothing holds either lock right now.
    pub fn try_gc_lock(&self) -> Option<GcLockGuard<'_>> {
        let mut state = self.state.lock();
        if state.gc_locked || state.async_counter > 0 {
            return None;
        }
        state.gc_locked = true;
        Some(GcLockGuard { sync: self })
    }

    fn gc_unlock(&self) {
        let mut state = self.state.lock();
        state.gc_locked = false;
        self.changed.notify_all();
    }

    pub fn is_async_locked(&self) -> bool {
        self.state.lock().async_counter > 0
    }

    pub fn is_gc_locked(&self) -> bool {
        self.state.lock().gc_locked
    }

    /// Whether a collection or purge is running right now.
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    pub(crate) fn collecting_scope(&self) -> CollectingScope<'_> {
        self.collecting.store(true, Ordering::Release);
        CollectingScope { sync: self }
    }
}

/// Held by a mutator; collections wait until it is dropped.
#[must_use = "the async lock is released when the guard is dropped"]
pub struct AsyncLockGuard<'a> {
    sync: &'a GcSyncObject,
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        self.sync.unlock_async();
    }
}

#[must_use = "the GC lock is released when the guard is dropped"]
pub struct GcLockGuard<'a> {
    sync: &'a GcSyncObject,
}

impl Drop for GcLockGuard<'_> {
    fn drop(&mut self) {
        self.sync.gc_unlock();
    }
}

pub(crate) struct CollectingScope<'a> {
    sync: &'a GcSyncObject,
}

impl Drop for CollectingScope<'_> {
    fn drop(&mut self) {
        self.sync.collecting.store(false, Ordering::Release);
    }
}
