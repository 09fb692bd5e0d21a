//! Signal masking and the signal-safety capability.
//!
//! Producers may run inside the profiler's sampling handler, interrupting a
//! thread that is itself inside the engine. Two rules keep that sound:
//!
//! - Code reachable from a handler never waits on a lock that normal thread
//!   code can hold with signals deliverable.
//! - Slow paths (arena master lock, file remaps) run with every signal
//!   blocked, so a handler can never interrupt them on the same thread.
//!
//! [`SignalsBlocked`] is the proof token for the second rule. Functions that
//! take a lock or perform blocking file I/O require `&SignalsBlocked`, so the
//! compiler rejects any call site that forgot to mask signals first.

use std::marker::PhantomData;
use std::mem::MaybeUninit;

/// RAII guard that blocks all signals on the current thread.
///
/// The previous mask is restored on drop. Guards nest: an inner guard
/// restores the (already fully blocked) mask of the outer one.
///
/// The guard is `!Send`: a signal mask belongs to exactly one thread.
///
/// # Example
///
/// ```rust
/// use collector_io::signal::SignalsBlocked;
///
/// let sig = SignalsBlocked::enter();
/// // ... slow path work that must not be interrupted by a handler ...
/// drop(sig);
/// ```
pub struct SignalsBlocked {
    previous: libc::sigset_t,
    _thread_bound: PhantomData<*const ()>,
}

impl SignalsBlocked {
    /// Block every signal on the calling thread.
    pub fn enter() -> Self {
        let mut all = MaybeUninit::<libc::sigset_t>::uninit();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigfillset initializes `all`; pthread_sigmask writes the
        // old mask into `previous` before we read it. Both calls are
        // async-signal-safe.
        let previous = unsafe {
            libc::sigfillset(all.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_BLOCK, all.as_ptr(), previous.as_mut_ptr());
            previous.assume_init()
        };
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }

    /// Check whether `signo` is blocked on the calling thread.
    pub fn is_blocked(signo: i32) -> bool {
        let mut current = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: a null `set` only queries the current mask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), current.as_mut_ptr());
            libc::sigismember(current.as_ptr(), signo) == 1
        }
    }
}

impl Drop for SignalsBlocked {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by pthread_sigmask in `enter`.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}
