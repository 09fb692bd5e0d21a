//! The text engine's packed file cursor.
//!
//! One 64-bit word holds the whole append state of a text stream:
//!
//! ```text
//!  63   62        57 56                                 0
//! +----+------------+------------------------------------+
//! |busy|   index    |              offset                |
//! +----+------------+------------------------------------+
//! ```
//!
//! - `busy`: a writer is mapping new buffers; everyone else waits.
//! - `index`: pool buffer holding the window that contains `offset`.
//! - `offset`: next file offset to be reserved.
//!
//! Every update is a compare-exchange of the full word.

use std::sync::atomic::{AtomicU64, Ordering};

const OFFSET_BITS: u32 = 57;
const INDEX_BITS: u32 = 6;
const INDEX_SHIFT: u32 = OFFSET_BITS;
const BUSY_SHIFT: u32 = OFFSET_BITS + INDEX_BITS;

/// Largest representable file offset.
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// Largest representable buffer index.
pub const MAX_INDEX: u8 = (1 << INDEX_BITS) - 1;

/// Decoded cursor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// A writer holds the cursor while mapping buffers.
    pub busy: bool,
    /// Current buffer.
    pub index: u8,
    /// Next file offset.
    pub offset: u64,
}

impl Cursor {
    /// Pack into one word.
    #[inline]
    pub const fn pack(self) -> u64 {
        debug_assert!(self.index <= MAX_INDEX);
        debug_assert!(self.offset <= MAX_OFFSET);
        ((self.busy as u64) << BUSY_SHIFT)
            | ((self.index as u64 & MAX_INDEX as u64) << INDEX_SHIFT)
            | (self.offset & MAX_OFFSET)
    }

    /// Unpack a word.
    #[inline]
    pub const fn unpack(word: u64) -> Self {
        Self {
            busy: (word >> BUSY_SHIFT) & 1 == 1,
            index: ((word >> INDEX_SHIFT) & MAX_INDEX as u64) as u8,
            offset: word & MAX_OFFSET,
        }
    }

    /// Same cursor with the busy bit set.
    #[inline]
    pub const fn locked(self) -> Self {
        Self {
            busy: true,
            index: self.index,
            offset: self.offset,
        }
    }
}

/// Atomic cell holding a packed [`Cursor`].
#[derive(Debug, Default)]
pub struct AtomicCursor(AtomicU64);

impl AtomicCursor {
    /// Create a cursor cell.
    pub const fn new(cursor: Cursor) -> Self {
        Self(AtomicU64::new(cursor.pack()))
    }

    /// Current value.
    #[inline]
    pub fn load(&self) -> Cursor {
        Cursor::unpack(self.0.load(Ordering::Acquire))
    }

    /// Replace `current` with `new`; on failure return the actual value.
    #[inline]
    pub fn compare_exchange(&self, current: Cursor, new: Cursor) -> Result<(), Cursor> {
        self.0
            .compare_exchange(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Cursor::unpack)
    }
}

/// End of the buffer window containing the bytes just before `offset`.
///
/// Windows are `buffer_size`-aligned runs of the file. Offset 0 belongs to
/// the first window.
#[inline]
pub const fn window_end(offset: u64, buffer_size: u64) -> u64 {
    if offset == 0 {
        buffer_size
    } else {
        offset.div_ceil(buffer_size) * buffer_size
    }
}
