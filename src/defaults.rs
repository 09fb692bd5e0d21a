//! Default sizes and limits for the capture engine.
//!
//! # Design Rationale
//!
//! - Block size follows the system page size so every block maps to exactly
//!   one file-backed page run.
//! - Chunk slots per lane bound how many producers can be in flight on one
//!   lane (a thread plus the handlers that interrupt it) before the lane
//!   reports overload.
//! - Text buffers are larger than blocks because log and map text arrives in
//!   bursts from a single cursor.

use std::time::Duration;

// =============================================================================
// Registry
// =============================================================================

/// Maximum number of concurrently active data handles.
pub const MAX_HANDLES: usize = 16;

/// Longest target path accepted for a stream file.
pub const MAX_PATH_LEN: usize = 4096;

// =============================================================================
// Block engine
// =============================================================================

/// Chunk slots per lane (blocks a lane can hold open at once).
pub const CHUNK_SLOTS: usize = 16;

/// Lane count used when the CPU count cannot be determined.
pub const FALLBACK_LANES: usize = 8;

// =============================================================================
// Text engine
// =============================================================================

/// Size of one text buffer in bytes.
pub const TEXT_BUFFER_SIZE: usize = 64 * 1024;

/// Number of buffers in a text handle's pool.
pub const TEXT_BUFFERS: usize = 32;

/// Largest pool the 6-bit cursor index can address.
pub const MAX_TEXT_BUFFERS: usize = 64;

/// Stack buffer used by formatted text writes.
pub const FORMAT_BUFFER_SIZE: usize = 1024;

// =============================================================================
// Arena
// =============================================================================

/// Size of one arena chunk (one anonymous mapping).
pub const ARENA_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum size and alignment of a fixed-size arena object.
pub const ARENA_MIN_ALIGN: usize = 16;

// =============================================================================
// Timeouts
// =============================================================================

/// Deadline for every bounded wait (busy cursor, chunk reservation, drain).
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Convenience Functions
// =============================================================================

/// Block size for a given page size: the next power of two >= `page_size`.
pub const fn block_size_for(page_size: usize) -> usize {
    page_size.next_power_of_two()
}

/// Size limit in blocks for a limit given in megabytes (0 = unlimited).
pub const fn limit_in_blocks(megabytes: u64, block_size: usize) -> u64 {
    if megabytes == 0 {
        u64::MAX
    } else {
        megabytes.saturating_mul(1024 * 1024) / block_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_for() {
        assert_eq!(block_size_for(4096), 4096);
        assert_eq!(block_size_for(16384), 16384);
        assert_eq!(block_size_for(3000), 4096);
    }

    #[test]
    fn test_limit_in_blocks() {
        assert_eq!(limit_in_blocks(0, 4096), u64::MAX);
        assert_eq!(limit_in_blocks(1, 4096), 256);
        assert_eq!(limit_in_blocks(2, 65536), 32);
    }

    #[test]
    fn test_cursor_index_fits_pool() {
        assert!(TEXT_BUFFERS <= MAX_TEXT_BUFFERS);
        assert_eq!(MAX_TEXT_BUFFERS, 1 << 6);
    }
}
