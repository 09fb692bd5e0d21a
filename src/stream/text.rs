//! Text engine: an ordered append stream.
//!
//! The file is covered by a sliding set of `buffer_size` windows, each mapped
//! into one buffer of a fixed pool. A single [`AtomicCursor`] orders all
//! appends:
//!
//! - **Fast path**: the string fits in the current window. One
//!   compare-exchange reserves the range, then the bytes are copied.
//! - **Slow path**: the string crosses into new windows. The writer blocks
//!   signals, sets the cursor's busy bit, maps the buffers it needs, publishes
//!   the advanced cursor and then copies.
//!
//! Each buffer counts the bytes of its window not yet copied in (`left`).
//! The writer whose copy brings the count to zero marks the buffer `FREE`;
//! only `FREE` (or never-mapped) buffers are remapped. A buffer is therefore
//! never pointed at new file content while part of its window is owed.
//!
//! A reserved range reads as zeros through the live mapping until its
//! writer's copy completes. Readers of the finished file never see this: a
//! handle is only drained once every buffer is `FREE`.

use super::cursor::{window_end, AtomicCursor, Cursor};
use super::handle::StreamIo;
use crate::config::EngineConfig;
use crate::defaults::MAX_TEXT_BUFFERS;
use crate::error::{Error, Result};
use crate::memory::{mapping, Arena, ArenaArray};
use crate::observability::events;
use crate::retry::{Retry, RetryPolicy};
use crate::signal::SignalsBlocked;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const BUF_UNMAPPED: u32 = 0;
const BUF_BUSY: u32 = 1;
const BUF_FREE: u32 = 2;

/// Decoded state of a pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Never mapped.
    Unmapped,
    /// Mapped; part of its window is still owed.
    Busy,
    /// Every byte of its window is written.
    Free,
}

struct TextBuffer {
    state: AtomicU32,
    left: AtomicUsize,
}

/// Engine state of a text handle.
pub struct TextEngine {
    buffer_size: usize,
    block_size: usize,
    pool: NonNull<u8>,
    buffers: ArenaArray<TextBuffer>,
    cursor: AtomicCursor,
    retry: RetryPolicy,
}

// SAFETY: `pool` is a private reservation; access to each window is
// arbitrated by the cursor and the buffer states.
unsafe impl Send for TextEngine {}
unsafe impl Sync for TextEngine {}

impl TextEngine {
    /// Reserve the pool and map the first window.
    pub(crate) fn new(
        arena: &Arena,
        io: &StreamIo<'_>,
        config: &EngineConfig,
        sig: &SignalsBlocked,
    ) -> Result<Self> {
        let buffer_size = config.text_buffer_size;
        let count = config.text_buffers.min(MAX_TEXT_BUFFERS);
        let buffers = ArenaArray::new_with(arena, count, sig, |_| TextBuffer {
            state: AtomicU32::new(BUF_UNMAPPED),
            left: AtomicUsize::new(0),
        })?;
        let pool = match mapping::reserve(buffer_size * count, sig) {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: allocated from `arena` above.
                unsafe { buffers.release(arena, sig) };
                return Err(e);
            }
        };

        let engine = Self {
            buffer_size,
            block_size: config.block_size,
            pool,
            buffers,
            cursor: AtomicCursor::new(Cursor::default()),
            retry: config.retry,
        };
        if let Err(e) = engine.map_buffer(io, 0, 0, sig) {
            // SAFETY: nothing else has seen the pool.
            if let Err(e) = unsafe { mapping::unmap(engine.pool, engine.pool_len()) } {
                events::unmap_failed(io.name, engine.pool_len(), &e);
            }
            // SAFETY: allocated from `arena` above.
            unsafe { engine.release_memory(arena, sig) };
            return Err(e);
        }
        engine.buffers[0].state.store(BUF_BUSY, Ordering::Release);
        Ok(engine)
    }

    /// Buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers in the pool.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Longest string a single append accepts.
    pub fn capacity(&self) -> usize {
        self.buffer_size * (self.buffers.len() - 1)
    }

    /// Current cursor.
    pub fn cursor(&self) -> Cursor {
        self.cursor.load()
    }

    /// Snapshot of a buffer's state.
    pub fn buffer_state(&self, index: usize) -> BufferState {
        match self.buffers[index].state.load(Ordering::Acquire) {
            BUF_UNMAPPED => BufferState::Unmapped,
            BUF_BUSY => BufferState::Busy,
            _ => BufferState::Free,
        }
    }

    /// Snapshot of a buffer's owed byte count.
    pub fn buffer_left(&self, index: usize) -> usize {
        self.buffers[index].left.load(Ordering::Acquire)
    }

    fn pool_len(&self) -> usize {
        self.buffer_size * self.buffers.len()
    }

    #[inline]
    fn window(&self, index: usize) -> *mut u8 {
        self.pool.as_ptr().wrapping_add(index * self.buffer_size)
    }

    /// Map buffer `index` onto the window starting at `file_offset`.
    fn map_buffer(
        &self,
        io: &StreamIo<'_>,
        index: usize,
        file_offset: u64,
        sig: &SignalsBlocked,
    ) -> Result<()> {
        let units = (self.buffer_size / self.block_size) as u64;
        if io.governor.charge(units) {
            return Err(Error::SizeLimitExceeded);
        }
        debug_assert_eq!(
            self.buffers[index].left.load(Ordering::Acquire),
            0,
            "buffer remapped while bytes are owed"
        );
        let addr = NonNull::new(self.window(index))
            .ok_or(Error::AllocationFailed("null buffer address"))?;
        // SAFETY: the window lies in our pool and the buffer is claimed.
        if let Err(e) =
            unsafe { mapping::map_file_window(io.fd, addr, self.buffer_size, file_offset, sig) }
        {
            io.deactivate(&e);
            return Err(e);
        }
        self.buffers[index].left.store(self.buffer_size, Ordering::Release);
        io.stats.record_mapped();
        Ok(())
    }

    /// Mark `n` bytes of buffer `index` as written.
    #[inline]
    fn consume(&self, index: usize, n: usize) {
        if n == 0 {
            return;
        }
        let buffer = &self.buffers[index];
        if buffer.left.fetch_sub(n, Ordering::AcqRel) == n {
            buffer.state.store(BUF_FREE, Ordering::Release);
        }
    }

    /// Copy `bytes` to file offset `offset` of buffer `index`'s window.
    ///
    /// # Safety
    ///
    /// The range must be reserved by the caller and lie in that window.
    #[inline]
    unsafe fn copy_in(&self, index: usize, window_start: u64, offset: u64, bytes: &[u8]) {
        let dst = self.window(index).wrapping_add((offset - window_start) as usize);
        // SAFETY: guaranteed by the caller.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    /// Append `bytes`.
    pub(crate) fn write(&self, io: &StreamIo<'_>, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        if len == 0 {
            return Ok(());
        }
        if len > self.capacity() {
            return Err(Error::TooLarge {
                len,
                capacity: self.capacity(),
            });
        }

        let bs = self.buffer_size as u64;
        let mut retry: Option<Retry> = None;
        loop {
            if !io.is_active() {
                return Err(Error::Inactive);
            }
            let c = self.cursor.load();
            if c.busy {
                let retry = retry.get_or_insert_with(|| self.retry.start());
                if !retry.wait() {
                    events::cursor_timed_out(io.name);
                    return Err(Error::Timeout("text cursor"));
                }
                continue;
            }

            let end = window_end(c.offset, bs);
            if c.offset + len as u64 <= end {
                let next = Cursor {
                    offset: c.offset + len as u64,
                    ..c
                };
                if self.cursor.compare_exchange(c, next).is_err() {
                    continue;
                }
                // SAFETY: the CAS reserved `c.offset..next.offset`, which lies in
                // the window of buffer `c.index`.
                unsafe { self.copy_in(c.index as usize, end - bs, c.offset, bytes) };
                self.consume(c.index as usize, len);
                return Ok(());
            }

            if self.write_slow(io, c, bytes)? {
                return Ok(());
            }
        }
    }

    /// Append `bytes` across new windows. `Ok(false)` means the cursor moved
    /// before it could be locked.
    fn write_slow(&self, io: &StreamIo<'_>, c: Cursor, bytes: &[u8]) -> Result<bool> {
        let sig = SignalsBlocked::enter();
        let locked = c.locked();
        if self.cursor.compare_exchange(c, locked).is_err() {
            return Ok(false);
        }

        let bs = self.buffer_size as u64;
        let end = window_end(c.offset, bs);
        let head = (end - c.offset) as usize;
        let needed = (bytes.len() - head).div_ceil(self.buffer_size);

        let mut claimed = [(0u8, BUF_UNMAPPED); MAX_TEXT_BUFFERS];
        let mut n = 0;
        for (index, buffer) in self.buffers.iter().enumerate() {
            if n == needed {
                break;
            }
            for prev in [BUF_FREE, BUF_UNMAPPED] {
                if buffer
                    .state
                    .compare_exchange(prev, BUF_BUSY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    claimed[n] = (index as u8, prev);
                    n += 1;
                    break;
                }
            }
        }
        if n < needed {
            self.abandon_claims(&claimed[..n], c, locked);
            return Err(Error::PoolExhausted);
        }

        for (j, &(index, _)) in claimed[..n].iter().enumerate() {
            let file_offset = end + j as u64 * bs;
            if let Err(e) = self.map_buffer(io, index as usize, file_offset, &sig) {
                self.abandon_claims(&claimed[..n], c, locked);
                return Err(e);
            }
        }

        let last = claimed[n - 1].0;
        let next = Cursor {
            busy: false,
            index: last,
            offset: c.offset + bytes.len() as u64,
        };
        let published = self.cursor.compare_exchange(locked, next);
        debug_assert!(published.is_ok(), "busy cursor changed under its holder");
        drop(sig);

        let (first, mut rest) = bytes.split_at(head);
        // SAFETY: `c.offset..end` was reserved with the cursor.
        unsafe { self.copy_in(c.index as usize, end - bs, c.offset, first) };
        self.consume(c.index as usize, head);
        for (j, &(index, _)) in claimed[..n].iter().enumerate() {
            let take = rest.len().min(self.buffer_size);
            let start = end + j as u64 * bs;
            // SAFETY: this window was mapped for us above.
            unsafe { self.copy_in(index as usize, start, start, &rest[..take]) };
            self.consume(index as usize, take);
            rest = &rest[take..];
        }
        Ok(true)
    }

    fn abandon_claims(&self, claimed: &[(u8, u32)], c: Cursor, locked: Cursor) {
        for &(index, prev) in claimed {
            let buffer = &self.buffers[index as usize];
            buffer.left.store(0, Ordering::Relaxed);
            buffer.state.store(prev, Ordering::Release);
        }
        let restored = self.cursor.compare_exchange(locked, c);
        debug_assert!(restored.is_ok(), "busy cursor changed under its holder");
    }

    /// Stop the stream, wait for every owed byte, unmap the pool and cut the
    /// file to its logical length.
    pub(crate) fn drain(&self, io: &StreamIo<'_>) -> Result<()> {
        let mut retry = self.retry.start();
        let c = loop {
            let c = self.cursor.load();
            if !c.busy {
                // The busy bit is never cleared again.
                if self.cursor.compare_exchange(c, c.locked()).is_ok() {
                    break c;
                }
                continue;
            }
            if !retry.wait() {
                events::cursor_timed_out(io.name);
                events::drain_timed_out(io.name, 1);
                return Err(Error::Timeout("text cursor"));
            }
        };

        // Account for the unwritten tail of the current window.
        let gap = (window_end(c.offset, self.buffer_size as u64) - c.offset) as usize;
        self.consume(c.index as usize, gap);

        let mut retry = self.retry.start();
        loop {
            let pending = (0..self.buffers.len())
                .filter(|&i| self.buffer_state(i) == BufferState::Busy)
                .count();
            if pending == 0 {
                break;
            }
            if !retry.wait() {
                events::drain_timed_out(io.name, pending);
                return Err(Error::Timeout("text drain"));
            }
        }

        // SAFETY: no buffer is owed anything and the cursor is locked forever.
        if let Err(e) = unsafe { mapping::unmap(self.pool, self.pool_len()) } {
            events::unmap_failed(io.name, self.pool_len(), &e);
        }
        let sig = SignalsBlocked::enter();
        if let Err(e) = mapping::truncate(io.fd, c.offset, &sig) {
            events::truncate_failed(io.name, c.offset, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Return the engine's metadata to `arena`.
    ///
    /// # Safety
    ///
    /// `arena` must be the arena the engine was created from.
    pub(crate) unsafe fn release_memory(self, arena: &Arena, sig: &SignalsBlocked) {
        // SAFETY: forwarded from the caller.
        unsafe { self.buffers.release(arena, sig) };
    }
}
