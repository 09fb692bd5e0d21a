//! Bounded retry policy for the engine's few waiting loops.
//!
//! The engine waits in exactly three places: a chunk being reserved by
//! another writer, the text cursor's busy bit, and deletion draining. Each
//! wait is bounded by a [`RetryPolicy`] so that no producer can hang forever,
//! including producers running inside a signal handler.

use std::time::{Duration, Instant};

/// How a [`Retry`] spends time between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// One spin-loop hint per attempt.
    Spin,
    /// `2^min(attempt, max_shift)` spin-loop hints per attempt, then yield
    /// the CPU once the shift is saturated.
    Exponential {
        /// Largest exponent used for the spin count.
        max_shift: u32,
    },
}

/// Retry policy: a deadline plus a backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time a wait may take before giving up.
    pub timeout: Duration,
    /// Backoff between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(crate::defaults::WAIT_TIMEOUT)
    }
}

impl RetryPolicy {
    /// Plain spinning with the given deadline.
    pub const fn spin(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: Backoff::Spin,
        }
    }

    /// Exponential backoff with the given deadline.
    pub const fn exponential(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: Backoff::Exponential { max_shift: 10 },
        }
    }

    /// Start a new bounded wait.
    pub fn start(&self) -> Retry {
        Retry {
            policy: *self,
            deadline: Instant::now() + self.timeout,
            attempt: 0,
        }
    }
}

/// State of one bounded wait.
#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    deadline: Instant,
    attempt: u32,
}

impl Retry {
    /// Back off once.
    ///
    /// Returns `false` when the deadline has passed and the caller must give
    /// up instead of trying again.
    pub fn wait(&mut self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        match self.policy.backoff {
            Backoff::Spin => std::hint::spin_loop(),
            Backoff::Exponential { max_shift } => {
                let shift = self.attempt.min(max_shift);
                for _ in 0..(1u32 << shift) {
                    std::hint::spin_loop();
                }
                if self.attempt >= max_shift {
                    std::thread::yield_now();
                }
            }
        }
        self.attempt = self.attempt.saturating_add(1);
        true
    }

    /// Number of completed backoff rounds.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
