//! Lock-free bitmap of registry handle slots.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free bitmap for claiming registry slots.
///
/// Each bit represents one handle slot: 0 = free, 1 = claimed. Claiming and
/// releasing never take a lock, so a slot can be released from any context.
///
/// # Performance
///
/// - `claim`: O(n/64) worst case, where n is the number of slots
/// - `release`: O(1)
pub struct SlotBitmap {
    words: Box<[AtomicU64]>,
    num_slots: usize,
}

impl SlotBitmap {
    /// Create a bitmap with `num_slots` free slots.
    pub fn new(num_slots: usize) -> Self {
        let num_words = num_slots.div_ceil(64);
        let words: Vec<AtomicU64> = (0..num_words).map(|_| AtomicU64::new(0)).collect();

        Self {
            words: words.into_boxed_slice(),
            num_slots,
        }
    }

    /// Claim the lowest free slot, or `None` if every slot is taken.
    pub fn claim(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            loop {
                if current == u64::MAX {
                    break;
                }

                let bit_idx = (!current).trailing_zeros() as usize;
                let slot_idx = word_idx * 64 + bit_idx;
                if slot_idx >= self.num_slots {
                    return None;
                }

                match word.compare_exchange_weak(
                    current,
                    current | (1u64 << bit_idx),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(slot_idx),
                    Err(actual) => current = actual,
                }
            }
        }

        None
    }

    /// Release a claimed slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot_idx` is out of bounds.
    pub fn release(&self, slot_idx: usize) {
        assert!(slot_idx < self.num_slots, "slot index out of bounds");
        self.words[slot_idx / 64].fetch_and(!(1u64 << (slot_idx % 64)), Ordering::Release);
    }

    /// Snapshot of whether a slot is claimed.
    pub fn is_claimed(&self, slot_idx: usize) -> bool {
        if slot_idx >= self.num_slots {
            return false;
        }
        (self.words[slot_idx / 64].load(Ordering::Acquire) & (1u64 << (slot_idx % 64))) != 0
    }

    /// Snapshot of the number of claimed slots.
    pub fn count_claimed(&self) -> usize {
        (0..self.num_slots).filter(|&i| self.is_claimed(i)).count()
    }

    /// Release every slot. Used when a forked child abandons its handles.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.num_slots
    }
}
