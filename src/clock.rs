//! Timestamps and producer identity for record headers.
//!
//! Everything here is a single system call or less and is safe to call from
//! a signal handler.

use rustix::time::{clock_gettime, ClockId};

/// Monotonic high-resolution time in nanoseconds.
#[inline]
pub fn hrtime() -> i64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Kernel thread id of the calling thread.
#[inline]
pub fn thread_id() -> u64 {
    rustix::thread::gettid().as_raw_nonzero().get() as u64
}

/// CPU the calling thread is running on, or `u32::MAX` if unknown.
#[inline]
pub fn current_cpu() -> u32 {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).unwrap_or(u32::MAX)
}

/// Lane for the calling thread among `lanes` lanes.
///
/// Thread ids are mixed first so neighbouring tids spread across lanes.
#[inline]
pub fn lane_for_thread(lanes: usize) -> usize {
    lane_for_id(thread_id(), lanes)
}

/// Lane for an arbitrary producer id.
#[inline]
pub fn lane_for_id(id: u64, lanes: usize) -> usize {
    debug_assert!(lanes > 0);
    // Fibonacci hashing.
    let mixed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((mixed >> 32) as usize) % lanes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_hrtime_is_monotonic() {
        let a = hrtime();
        let b = hrtime();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_thread_ids_differ() {
        let main = thread_id();
        let other = thread::spawn(thread_id).join().unwrap();
        assert_ne!(main, other);
        assert_eq!(main, thread_id());
    }

    #[test]
    fn test_lane_in_range() {
        for id in 0..1000u64 {
            assert!(lane_for_id(id, 7) < 7);
        }
        assert_eq!(lane_for_id(12345, 1), 0);
        assert!(lane_for_thread(4) < 4);
    }

    #[test]
    fn test_lanes_spread() {
        let mut hit = [false; 8];
        for id in 1000..1064u64 {
            hit[lane_for_id(id, 8)] = true;
        }
        assert!(hit.iter().filter(|&&h| h).count() >= 6);
    }
}
