//! Experiment size governor.
//!
//! A lock-free byte budget shared by every handle of an engine. Each new
//! block or text buffer mapped to a file is charged here first. The first
//! charge that pushes the total past the limit trips the governor exactly
//! once: it logs a warning, pauses capture, and asks the session owner to
//! end the experiment.

use crate::defaults::limit_in_blocks;
use crate::observability::events;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Hook into the external collaborator that owns the experiment lifecycle.
pub trait ExperimentControl: Send + Sync {
    /// End the experiment. Called at most once per governor.
    fn terminate(&self, reason: TerminateReason);
}

/// Why the engine asked to end the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The configured size limit was exceeded.
    SizeLimit {
        /// Limit in blocks.
        limit_blocks: u64,
    },
}

/// Control hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControl;

impl ExperimentControl for NoopControl {
    fn terminate(&self, _reason: TerminateReason) {}
}

/// Atomic size budget and the engine-wide cooperative pause flag.
pub struct SizeGovernor {
    block_size: usize,
    /// Limit in blocks; `u64::MAX` means unlimited.
    limit: AtomicU64,
    charged: AtomicU64,
    tripped: AtomicBool,
    trips: AtomicU64,
    paused: AtomicBool,
    control: Arc<dyn ExperimentControl>,
}

impl SizeGovernor {
    /// Create an unlimited governor counting in units of `block_size` bytes.
    pub fn new(block_size: usize, control: Arc<dyn ExperimentControl>) -> Self {
        Self {
            block_size,
            limit: AtomicU64::new(u64::MAX),
            charged: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
            trips: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            control,
        }
    }

    /// Set the limit in megabytes (0 = unlimited).
    pub fn set_size_limit(&self, megabytes: u64) {
        self.set_limit_blocks(limit_in_blocks(megabytes, self.block_size));
    }

    /// Set the limit directly in blocks (`u64::MAX` = unlimited).
    pub fn set_limit_blocks(&self, blocks: u64) {
        self.limit.store(blocks, Ordering::Release);
    }

    /// Current limit in blocks.
    pub fn limit_blocks(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Blocks charged so far.
    pub fn charged_blocks(&self) -> u64 {
        self.charged.load(Ordering::Acquire)
    }

    /// Bytes per charged block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Charge `n_blocks` against the budget.
    ///
    /// Returns `true` if the total now exceeds the limit, in which case the
    /// caller must not map the new region. Exactly one caller (the one whose
    /// charge crosses the limit) performs the trip.
    pub fn charge(&self, n_blocks: u64) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        let prev = self.charged.fetch_add(n_blocks, Ordering::AcqRel);
        let total = prev.saturating_add(n_blocks);
        if total <= limit {
            return false;
        }
        if !self.tripped.swap(true, Ordering::AcqRel) {
            self.trip(limit, total);
        }
        true
    }

    fn trip(&self, limit: u64, total: u64) {
        self.trips.fetch_add(1, Ordering::Relaxed);
        events::size_limit_reached(limit, total);
        self.pause();
        self.control.terminate(TerminateReason::SizeLimit {
            limit_blocks: limit,
        });
    }

    /// Whether the limit has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Number of trip transitions performed (0 or 1).
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Pause capture. Producers observe the flag and drop their writes.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume capture, unless the size limit has ended the experiment.
    pub fn resume(&self) -> bool {
        if self.is_tripped() {
            return false;
        }
        self.paused.store(false, Ordering::Release);
        true
    }

    /// Whether capture is paused.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}
