//! The arena's master lock.
//!
//! A plain spin lock: it never sleeps, never allocates and can be reset in a
//! forked child. Acquiring it requires `&SignalsBlocked`, so the thread that
//! holds it cannot be interrupted by a handler that would spin on it forever.

use crate::signal::SignalsBlocked;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-reentrant spin lock protecting a value.
pub struct MasterLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `held`.
unsafe impl<T: Send> Send for MasterLock<T> {}
unsafe impl<T: Send> Sync for MasterLock<T> {}

impl<T> MasterLock<T> {
    /// Create an unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock<'a>(&'a self, _sig: &'a SignalsBlocked) -> MasterGuard<'a, T> {
        loop {
            if self
                .held
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return MasterGuard { lock: self };
            }
            while self.held.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock<'a>(&'a self, _sig: &'a SignalsBlocked) -> Option<MasterGuard<'a, T>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MasterGuard { lock: self })
    }

    /// Access the value through exclusive ownership; no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Snapshot of whether some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Force the lock open in a forked child.
    ///
    /// # Safety
    ///
    /// Only the forking thread survives `fork()`. The caller must be that
    /// thread, running in the child, with no guard of its own alive.
    pub unsafe fn reset_after_fork(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Guard returned by [`MasterLock::lock`].
pub struct MasterGuard<'a, T> {
    lock: &'a MasterLock<T>,
}

impl<T> Deref for MasterGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for MasterGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for MasterGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
